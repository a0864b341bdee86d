use datakit_core::{
    register_model, save, AttributeDescription, AttributeType, DataKit, EntityDescription,
    SaveResult, Schema,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// One test only: the shared instance binds its main thread on first access.
#[test]
fn shared_kit_saves_with_registered_models() {
    register_model(
        Schema::new(1).with_entity(
            EntityDescription::new("Bookmark")
                .with_attribute(AttributeDescription::required("url", AttributeType::Text)),
        ),
    );
    register_model(
        Schema::new(1).with_entity(
            EntityDescription::new("Folder")
                .with_attribute(AttributeDescription::optional("name", AttributeType::Text)),
        ),
    );

    let kit = DataKit::shared();
    assert!(std::ptr::eq(kit, DataKit::shared()));
    assert!(kit.is_main_thread());
    kit.setup_in_memory_stack().unwrap();

    let coordinator = kit.coordinator().unwrap();
    assert!(coordinator.schema().entity("Bookmark").is_some());
    assert!(coordinator.schema().entity("Folder").is_some());

    let saved: Arc<Mutex<Option<SaveResult>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&saved);
    save(
        |work| {
            let id = work.insert("Bookmark")?;
            work.set(id, "url", "https://example.org")
        },
        move |result| {
            *sink.lock().unwrap() = Some(result);
        },
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while saved.lock().unwrap().is_none() {
        assert!(Instant::now() < deadline, "shared save never completed");
        kit.wait_for_main_queue(Duration::from_millis(50)).unwrap();
    }

    let id = saved.lock().unwrap().take().unwrap().unwrap().inserted_ids()[0];
    let bookmark = kit.main_context().unwrap().object(id).unwrap().unwrap();
    assert_eq!(bookmark.text("url"), Some("https://example.org"));
}
