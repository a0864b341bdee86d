use datakit_core::{
    AttributeDescription, AttributeType, AttributeValue, DataKit, EntityDescription, Schema,
    SetupError,
};
use std::path::Path;

fn v1_schema() -> Schema {
    Schema::new(1)
        .with_entity(
            EntityDescription::new("Book")
                .with_attribute(AttributeDescription::required("title", AttributeType::Text))
                .with_attribute(AttributeDescription::optional("isbn", AttributeType::Text)),
        )
        .with_entity(
            EntityDescription::new("Loan")
                .with_attribute(AttributeDescription::required("borrower", AttributeType::Text)),
        )
}

fn seed_v1(directory: &Path) {
    let kit = DataKit::new();
    kit.setup_stack_at(directory, "Library", false, Some(v1_schema()))
        .unwrap();
    kit.save_and_wait(|work| {
        let book = work.insert("Book")?;
        work.set(book, "title", "Dune")?;
        work.set(book, "isbn", "978-0441013593")?;
        let loan = work.insert("Loan")?;
        work.set(loan, "borrower", "sam")
    })
    .unwrap();
}

#[test]
fn automigration_applies_defaults_and_drops_removed_parts() {
    let dir = tempfile::tempdir().unwrap();
    seed_v1(dir.path());

    let v2 = Schema::new(2).with_entity(
        EntityDescription::new("Book")
            .with_attribute(AttributeDescription::required("title", AttributeType::Text))
            .with_attribute(
                AttributeDescription::required("pages", AttributeType::Integer)
                    .with_default(AttributeValue::Integer(0)),
            ),
    );
    let kit = DataKit::new();
    kit.setup_stack_at(dir.path(), "Library", true, Some(v2))
        .unwrap();

    let main = kit.main_context().unwrap();
    let books = main.objects("Book").unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].text("title"), Some("Dune"));
    assert_eq!(books[0].get("pages"), Some(&AttributeValue::Integer(0)));
    assert_eq!(books[0].get("isbn"), None);
    assert_eq!(books[0].version(), 2);
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 1);
    assert_eq!(kit.coordinator().unwrap().schema().version, 2);
}

#[test]
fn migrated_store_reopens_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    seed_v1(dir.path());
    let v2 = Schema {
        version: 2,
        ..v1_schema()
    };

    let kit = DataKit::new();
    kit.setup_stack_at(dir.path(), "Library", true, Some(v2.clone()))
        .unwrap();
    kit.setup_stack_at(dir.path(), "Library", false, Some(v2))
        .unwrap();

    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 2);
}

#[test]
fn added_required_attribute_without_default_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    seed_v1(dir.path());

    let v2 = Schema::new(2).with_entity(
        EntityDescription::new("Book")
            .with_attribute(AttributeDescription::required("title", AttributeType::Text))
            .with_attribute(AttributeDescription::required("author", AttributeType::Text)),
    );
    let kit = DataKit::new();
    let err = kit
        .setup_stack_at(dir.path(), "Library", true, Some(v2))
        .unwrap_err();
    assert!(matches!(err, SetupError::MigrationFailed(reason) if reason.contains("author")));
    assert!(!kit.is_set_up());

    kit.setup_stack_at(dir.path(), "Library", false, Some(v1_schema()))
        .unwrap();
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 2);
    let loans = kit.main_context().unwrap().objects("Loan").unwrap();
    assert_eq!(loans[0].text("borrower"), Some("sam"));
}

#[test]
fn changed_attribute_type_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    seed_v1(dir.path());

    let v2 = Schema::new(2).with_entity(
        EntityDescription::new("Book")
            .with_attribute(AttributeDescription::required("title", AttributeType::Integer)),
    );
    let err = DataKit::new()
        .setup_stack_at(dir.path(), "Library", true, Some(v2))
        .unwrap_err();

    assert!(matches!(err, SetupError::MigrationFailed(reason) if reason.contains("title")));
}

#[test]
fn downgrade_is_refused_even_when_automigrating() {
    let dir = tempfile::tempdir().unwrap();
    seed_v1(dir.path());

    let older = Schema {
        version: 0,
        ..v1_schema()
    };
    let err = DataKit::new()
        .setup_stack_at(dir.path(), "Library", true, Some(older))
        .unwrap_err();

    assert!(matches!(
        err,
        SetupError::IncompatibleSchema {
            store_version: 1,
            model_version: 0
        }
    ));
}
