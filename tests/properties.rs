use proptest::prelude::*;
use time::macros::datetime;

use invoice_drafter::applier::apply_structured_invoice_update;
use invoice_drafter::heuristics::{DraftRequest, generate_invoice_draft_at};
use invoice_drafter::model::{DiscountType, InvoiceSnapshot, InvoiceStatus};
use invoice_drafter::money::round_currency;
use invoice_drafter::serialization::{record_from_draft, snapshot_from_record};
use invoice_drafter::update::{Adjustments, ItemInput, ItemUpdate, Patch, StructuredInvoiceUpdate, UpdateSet};

const NAMES: &[&str] = &["Design work", "Hosting", "Support", "Audit", "  hosting "];

fn seed_invoice() -> InvoiceSnapshot {
    let draft = generate_invoice_draft_at(
        &DraftRequest::new(
            "Invoice for Acme Corp\n- Design work x2 @ 150\n- Hosting x1 @ 40\ntax 8%\ndiscount 10%",
        ),
        datetime!(2024-03-05 14:30:15 UTC),
    );
    let record = record_from_draft("inv", "owner", &draft, datetime!(2024-03-05 14:30:15 UTC)).unwrap();
    snapshot_from_record(&record).unwrap()
}

fn name() -> impl Strategy<Value = String> {
    prop::sample::select(NAMES).prop_map(str::to_string)
}

fn patch_number(range: std::ops::Range<f64>) -> impl Strategy<Value = Patch<f64>> {
    prop_oneof![Just(Patch::Absent), range.prop_map(Patch::Value)]
}

fn update_set() -> impl Strategy<Value = UpdateSet> {
    (
        prop_oneof![
            Just(Patch::Absent),
            Just(Patch::Value(DiscountType::Percentage)),
            Just(Patch::Value(DiscountType::Fixed)),
        ],
        patch_number(-50.0..150.0),
        patch_number(-100.0..2_000.0),
        patch_number(-50.0..150.0),
        prop_oneof![Just(Patch::Absent), Just(Patch::Null), "[a-z ]{0,12}".prop_map(Patch::Value)],
    )
        .prop_map(|(discount_type, discount_rate, discount_amount, tax_rate, notes)| UpdateSet {
            discount_type,
            discount_rate,
            discount_amount,
            tax_rate,
            notes,
            ..UpdateSet::default()
        })
}

fn adjustments() -> impl Strategy<Value = Adjustments> {
    (
        prop::option::of(-120.0..120.0f64),
        prop::option::of(-1_000.0..1_000.0f64),
        prop::option::of(-120.0..120.0f64),
    )
        .prop_map(|(discount_rate_delta, discount_amount_delta, tax_rate_delta)| Adjustments {
            discount_rate_delta,
            discount_amount_delta,
            tax_rate_delta,
        })
}

fn item_input() -> impl Strategy<Value = ItemInput> {
    (name(), -5.0..50.0f64, -10.0..1_000.0f64).prop_map(|(name, quantity, unit_price)| ItemInput {
        name,
        description: String::new(),
        quantity,
        unit_price,
    })
}

fn item_update() -> impl Strategy<Value = ItemUpdate> {
    (name(), patch_number(-5.0..50.0), patch_number(-10.0..1_000.0)).prop_map(
        |(target_name, quantity, unit_price)| ItemUpdate {
            target_name,
            name: Patch::Absent,
            description: Patch::Absent,
            quantity,
            unit_price,
        },
    )
}

fn structured_update() -> impl Strategy<Value = StructuredInvoiceUpdate> {
    (
        prop::option::of(update_set()),
        prop::option::of(adjustments()),
        prop::collection::vec(item_input(), 0..3),
        prop::collection::vec(item_update(), 0..3),
        prop::collection::vec(name(), 0..3),
    )
        .prop_map(|(set, adjustments, add_items, update_items, remove_items)| {
            StructuredInvoiceUpdate {
                set,
                adjustments,
                add_items,
                update_items,
                remove_items,
            }
        })
}

fn assert_consistent(invoice: &InvoiceSnapshot) {
    assert_eq!(invoice.status, InvoiceStatus::Ready);
    assert!(!invoice.items.is_empty());

    for item in &invoice.items {
        assert!(item.quantity >= 1);
        assert!(item.unit_price >= 0.0);
        assert_eq!(item.line_total, round_currency(item.quantity as f64 * item.unit_price));
    }

    let subtotal = round_currency(invoice.items.iter().map(|i| i.line_total).sum());
    assert_eq!(invoice.subtotal, subtotal);
    assert!((0.0..=100.0).contains(&invoice.discount_rate));
    assert!((0.0..=100.0).contains(&invoice.tax_rate));
    assert!(invoice.discount_amount >= 0.0);
    assert!(invoice.discount_amount <= invoice.subtotal);

    let taxable = round_currency(invoice.subtotal - invoice.discount_amount);
    assert_eq!(invoice.tax_amount, round_currency(taxable * invoice.tax_rate / 100.0));
    assert_eq!(invoice.total, round_currency(taxable + invoice.tax_amount));
}

proptest! {
    #[test]
    fn applied_updates_keep_totals_consistent(
        updates in prop::collection::vec(structured_update(), 1..6)
    ) {
        let mut invoice = seed_invoice();
        for update in &updates {
            invoice = apply_structured_invoice_update(&invoice, update);
            assert_consistent(&invoice);
        }

        let again = apply_structured_invoice_update(&invoice, &StructuredInvoiceUpdate::default());
        prop_assert_eq!(again, invoice);
    }

    #[test]
    fn identity_fields_survive_any_update(update in structured_update()) {
        let invoice = seed_invoice();
        let next = apply_structured_invoice_update(&invoice, &update);
        prop_assert_eq!(&next.id, &invoice.id);
        prop_assert_eq!(&next.invoice_number, &invoice.invoice_number);
        prop_assert_eq!(&next.prompt, &invoice.prompt);
        prop_assert_eq!(&next.source_text, &invoice.source_text);
    }
}
