use datakit_core::{
    AttributeDescription, AttributeType, ContextError, DataKit, EntityDescription, ObjectId,
    Schema,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn kit_with_note() -> (DataKit, ObjectId) {
    let kit = DataKit::new();
    kit.setup_in_memory_stack_with_schema(Some(Schema::new(1).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::required("body", AttributeType::Text)),
    )))
    .unwrap();
    let id = kit
        .save_and_wait(|work| {
            let id = work.insert("Note")?;
            work.set(id, "body", "hello")
        })
        .unwrap()
        .inserted_ids()[0];
    (kit, id)
}

#[test]
fn main_context_rejects_other_threads() {
    let (kit, id) = kit_with_note();
    let main = kit.main_context().unwrap();

    thread::scope(|scope| {
        let result = scope.spawn(|| main.object(id)).join().unwrap();
        assert!(matches!(result, Err(ContextError::WrongThread)));
        let pumped = scope.spawn(|| kit.process_main_queue()).join().unwrap();
        assert!(matches!(pumped, Err(ContextError::WrongThread)));
    });
    assert!(main.object(id).unwrap().is_some());
}

#[test]
fn root_context_is_usable_from_any_thread() {
    let (kit, id) = kit_with_note();
    let root = kit.root_context().unwrap();

    let body = thread::spawn(move || {
        root.object(id)
            .unwrap()
            .and_then(|note| note.text("body").map(str::to_string))
    })
    .join()
    .unwrap();

    assert_eq!(body.as_deref(), Some("hello"));
}

#[test]
fn blocking_root_call_from_root_queue_would_deadlock() {
    let (kit, _) = kit_with_note();
    let root = kit.root_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let inner = root.clone();
    root.perform(move |state| {
        let blocked = inner.has_changes();
        let _ = tx.send((inner.is_current(), state.has_changes(), blocked));
    })
    .unwrap();

    let (is_current, has_changes, blocked) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(is_current);
    assert!(!has_changes);
    assert!(matches!(blocked, Err(ContextError::WouldDeadlock)));
    assert!(!root.is_current());
}

#[test]
fn root_jobs_run_in_submission_order() {
    let (kit, _) = kit_with_note();
    let root = kit.root_context().unwrap();
    let (tx, rx) = mpsc::channel();

    for index in 0..10 {
        let tx = tx.clone();
        root.perform(move |_| {
            let _ = tx.send(index);
        })
        .unwrap();
    }
    drop(tx);

    let order: Vec<i32> = rx.iter().collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[test]
fn panicking_root_job_reports_and_queue_survives() {
    let (kit, id) = kit_with_note();
    let root = kit.root_context().unwrap();

    let result = root.perform_and_wait(|_| -> u32 { panic!("root job exploded") });
    assert!(matches!(result, Err(ContextError::JobPanicked)));

    assert!(root.object(id).unwrap().is_some());
}

#[test]
fn refresh_and_reset_drop_cached_objects() {
    let (kit, id) = kit_with_note();
    let main = kit.main_context().unwrap();
    main.object(id).unwrap();
    assert_eq!(main.cached_count().unwrap(), 1);

    main.refresh(id).unwrap();
    assert_eq!(main.cached_count().unwrap(), 0);

    main.object(id).unwrap();
    main.reset().unwrap();
    assert_eq!(main.cached_count().unwrap(), 0);
    assert!(main.object(id).unwrap().is_some());
}

#[test]
fn root_save_without_pending_changes_is_empty() {
    let (kit, _) = kit_with_note();
    let root = kit.root_context().unwrap();

    let saved = root
        .perform_and_wait(|state| state.save().map(|changes| changes.is_empty()))
        .unwrap();

    assert!(matches!(saved, Ok(true)));
}
