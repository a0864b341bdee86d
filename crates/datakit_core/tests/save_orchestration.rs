use datakit_core::{
    in_mutation, AttributeDescription, AttributeType, AttributeValue, ContextError, DataKit,
    EntityDescription, ObjectId, ObjectStore, SaveError, SaveResult, Schema, SchemaError,
    SetupError, ValidationError,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn task_schema() -> Schema {
    Schema::new(1).with_entity(
        EntityDescription::new("Task")
            .with_attribute(AttributeDescription::required("title", AttributeType::Text))
            .with_attribute(
                AttributeDescription::required("done", AttributeType::Boolean)
                    .with_default(AttributeValue::Boolean(false)),
            )
            .with_attribute(AttributeDescription::optional("rank", AttributeType::Integer)),
    )
}

fn in_memory_kit() -> DataKit {
    let kit = DataKit::new();
    kit.setup_in_memory_stack_with_schema(Some(task_schema()))
        .unwrap();
    kit
}

fn insert_task(kit: &DataKit, title: &'static str) -> ObjectId {
    let summary = kit
        .save_and_wait(move |work| {
            let id = work.insert("Task")?;
            work.set(id, "title", title)
        })
        .unwrap();
    summary.inserted_ids()[0]
}

fn pump_until(kit: &DataKit, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "main queue never delivered");
        kit.wait_for_main_queue(Duration::from_millis(50)).unwrap();
    }
}

#[test]
fn inserted_object_is_fetchable_from_main_context() {
    let kit = in_memory_kit();
    let saved: Arc<Mutex<Option<SaveResult>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&saved);

    kit.save(
        |work| {
            let id = work.insert("Task")?;
            work.set(id, "title", "x")
        },
        move |result| {
            *sink.lock().unwrap() = Some(result);
        },
    );
    pump_until(&kit, || saved.lock().unwrap().is_some());

    let summary = saved.lock().unwrap().take().unwrap().unwrap();
    let id = summary.inserted_ids()[0];
    let object = kit.main_context().unwrap().object(id).unwrap().unwrap();
    assert_eq!(object.text("title"), Some("x"));
    assert_eq!(object.get("done"), Some(&AttributeValue::Boolean(false)));
}

#[test]
fn saved_object_is_visible_from_root_store_and_main() {
    let kit = in_memory_kit();
    let id = insert_task(&kit, "everywhere");

    let from_root = kit.root_context().unwrap().object(id).unwrap().unwrap();
    let from_store = kit.coordinator().unwrap().fetch_object(id).unwrap().unwrap();
    let from_main = kit.main_context().unwrap().object(id).unwrap().unwrap();

    assert_eq!(from_root.text("title"), Some("everywhere"));
    assert_eq!(from_store.text("title"), Some("everywhere"));
    assert_eq!(from_main.text("title"), Some("everywhere"));
    assert_eq!(from_store.version(), 1);
    assert!(!kit.root_context().unwrap().has_changes().unwrap());
}

#[test]
fn empty_mutation_completes_without_error() {
    let kit = in_memory_kit();

    let summary = kit.save_and_wait(|_| Ok(())).unwrap();

    assert!(summary.is_empty());
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 0);
}

#[test]
fn missing_required_attribute_fails_and_leaves_store_unchanged() {
    let kit = in_memory_kit();
    insert_task(&kit, "valid");

    let err = kit
        .save_and_wait(|work| {
            work.insert("Task")?;
            work.insert("Task")?;
            Ok(())
        })
        .unwrap_err();

    match err {
        SaveError::Validation(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().all(|error| matches!(
                error,
                ValidationError::MissingRequired { attribute, .. } if attribute == "title"
            )));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 1);
    assert!(!kit.root_context().unwrap().has_changes().unwrap());
}

#[test]
fn completions_fire_in_submission_order() {
    let kit = in_memory_kit();
    let order = Arc::new(Mutex::new(Vec::new()));

    for index in 0..20_i64 {
        let order = Arc::clone(&order);
        kit.save(
            move |work| {
                let id = work.insert("Task")?;
                work.set(id, "title", format!("task {index}"))?;
                work.set(id, "rank", index)
            },
            move |result| {
                assert!(result.is_ok());
                order.lock().unwrap().push(index);
            },
        );
    }
    pump_until(&kit, || order.lock().unwrap().len() == 20);

    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    let ranks: Vec<i64> = kit
        .main_context()
        .unwrap()
        .objects("Task")
        .unwrap()
        .iter()
        .filter_map(|task| task.get("rank").and_then(AttributeValue::as_integer))
        .collect();
    assert_eq!(ranks, (0..20).collect::<Vec<_>>());
}

#[test]
fn completion_runs_on_main_thread_when_saved_from_another_thread() {
    let kit = in_memory_kit();
    let main_thread = thread::current().id();
    let observed = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|scope| {
        for _ in 0..3 {
            let observed = Arc::clone(&observed);
            let kit = &kit;
            scope.spawn(move || {
                assert!(!kit.is_main_thread());
                kit.save(
                    |work| {
                        let id = work.insert("Task")?;
                        work.set(id, "title", "background")
                    },
                    move |result| {
                        assert!(result.is_ok());
                        observed.lock().unwrap().push(thread::current().id());
                    },
                );
            });
        }
    });
    pump_until(&kit, || observed.lock().unwrap().len() == 3);

    assert!(observed
        .lock()
        .unwrap()
        .iter()
        .all(|thread_id| *thread_id == main_thread));
}

#[test]
fn failing_mutation_aborts_without_saving() {
    let kit = in_memory_kit();

    let err = kit
        .save_and_wait(|work| {
            let id = work.insert("Task")?;
            work.set(id, "title", "never saved")?;
            work.insert("Project")?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(
        err,
        SaveError::Aborted(ContextError::UnknownEntity(entity)) if entity == "Project"
    ));
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 0);
}

#[test]
fn panicking_mutation_is_reported_and_queue_keeps_running() {
    let kit = in_memory_kit();

    let err = kit
        .save_and_wait(|_| panic!("mutation exploded"))
        .unwrap_err();
    assert!(matches!(err, SaveError::MutationPanicked(message) if message.contains("exploded")));

    let id = insert_task(&kit, "after panic");
    assert!(kit.root_context().unwrap().object(id).unwrap().is_some());
}

#[test]
fn save_from_inside_mutation_is_rejected() {
    let kit = Arc::new(in_memory_kit());
    let nested: Arc<Mutex<Option<SaveResult>>> = Arc::new(Mutex::new(None));

    let inner_kit = Arc::clone(&kit);
    let nested_sink = Arc::clone(&nested);
    let summary = kit
        .save_and_wait(move |work| {
            assert!(in_mutation());
            inner_kit.save(
                |_| Ok(()),
                move |result| {
                    *nested_sink.lock().unwrap() = Some(result);
                },
            );
            let id = work.insert("Task")?;
            work.set(id, "title", "outer")
        })
        .unwrap();

    assert_eq!(summary.inserted_ids().len(), 1);
    assert!(!in_mutation());
    assert!(matches!(
        nested.lock().unwrap().take(),
        Some(Err(SaveError::NestedSave))
    ));
}

#[test]
fn save_from_completion_is_allowed() {
    let kit = Arc::new(in_memory_kit());
    let finished = Arc::new(Mutex::new(Vec::new()));

    let chained_kit = Arc::clone(&kit);
    let first_done = Arc::clone(&finished);
    kit.save(
        |work| {
            let id = work.insert("Task")?;
            work.set(id, "title", "first")
        },
        move |result| {
            assert!(result.is_ok());
            first_done.lock().unwrap().push("first");
            let second_done = Arc::clone(&first_done);
            chained_kit.save(
                |work| {
                    let id = work.insert("Task")?;
                    work.set(id, "title", "second")
                },
                move |result| {
                    assert!(result.is_ok());
                    second_done.lock().unwrap().push("second");
                },
            );
        },
    );
    pump_until(&kit, || finished.lock().unwrap().len() == 2);

    assert_eq!(*finished.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 2);
}

#[test]
fn save_before_setup_completes_with_not_set_up() {
    let kit = DataKit::new();

    let err = kit.save_and_wait(|_| Ok(())).unwrap_err();

    assert!(matches!(err, SaveError::NotSetUp));
}

#[test]
fn update_is_merged_into_main_context_before_completion() {
    let kit = Arc::new(in_memory_kit());
    let id = insert_task(&kit, "before");
    let main = kit.main_context().unwrap();
    assert_eq!(
        main.object(id).unwrap().unwrap().text("title"),
        Some("before")
    );
    assert_eq!(main.cached_count().unwrap(), 1);

    let seen_in_completion = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen_in_completion);
    let completion_main = main.clone();
    kit.save(
        move |work| work.set(id, "title", "after"),
        move |result| {
            assert!(result.is_ok());
            let cached = completion_main.object(id).unwrap().unwrap();
            *sink.lock().unwrap() = Some((cached.text("title").map(str::to_string), cached.version()));
        },
    );
    pump_until(&kit, || seen_in_completion.lock().unwrap().is_some());

    let (title, version) = seen_in_completion.lock().unwrap().take().unwrap();
    assert_eq!(title.as_deref(), Some("after"));
    assert_eq!(version, 2);
}

#[test]
fn deleted_object_disappears_everywhere() {
    let kit = in_memory_kit();
    let keep = insert_task(&kit, "keep");
    let doomed = insert_task(&kit, "doomed");
    let main = kit.main_context().unwrap();
    assert!(main.object(doomed).unwrap().is_some());

    let summary = kit.save_and_wait(move |work| work.delete(doomed)).unwrap();

    assert_eq!(summary.changes().deleted(), &[doomed]);
    assert!(main.object(doomed).unwrap().is_none());
    assert!(kit.root_context().unwrap().object(doomed).unwrap().is_none());
    let remaining = main.objects("Task").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), keep);
}

#[test]
fn editing_unknown_object_aborts() {
    let kit = in_memory_kit();
    let missing = ObjectId::new();

    let err = kit
        .save_and_wait(move |work| work.set(missing, "title", "ghost"))
        .unwrap_err();

    assert!(matches!(err, SaveError::Aborted(ContextError::ObjectNotFound(id)) if id == missing));
}

fn reading_schema(default_value: f64) -> Schema {
    Schema::new(1).with_entity(
        EntityDescription::new("Reading")
            .with_attribute(AttributeDescription::required("value", AttributeType::Double))
            .with_attribute(
                AttributeDescription::required("offset", AttributeType::Double)
                    .with_default(AttributeValue::Double(default_value)),
            ),
    )
}

#[test]
fn non_finite_double_is_rejected_and_store_stays_readable() {
    let dir = tempfile::tempdir().unwrap();
    let kit = DataKit::new();
    kit.setup_stack_at(dir.path(), "Sensors", false, Some(reading_schema(0.0)))
        .unwrap();

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = kit
            .save_and_wait(move |work| {
                let id = work.insert("Reading")?;
                work.set(id, "value", bad)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SaveError::Aborted(ContextError::NonFiniteValue { ref attribute }) if attribute == "value"
        ));
    }
    kit.save_and_wait(|work| {
        let id = work.insert("Reading")?;
        work.set(id, "value", 1.5)
    })
    .unwrap();
    assert_eq!(kit.coordinator().unwrap().object_count().unwrap(), 1);
    drop(kit);

    let reopened = DataKit::new();
    reopened
        .setup_stack_at(dir.path(), "Sensors", false, Some(reading_schema(0.0)))
        .unwrap();
    let readings = reopened.main_context().unwrap().objects("Reading").unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].get("value"), Some(&AttributeValue::Double(1.5)));
}

#[test]
fn non_finite_default_fails_setup() {
    let kit = DataKit::new();

    let err = kit
        .setup_in_memory_stack_with_schema(Some(reading_schema(f64::NAN)))
        .unwrap_err();

    assert!(matches!(
        err,
        SetupError::Schema(SchemaError::InvalidDefault { ref attribute, .. }) if attribute == "offset"
    ));
    assert!(!kit.is_set_up());
}

#[test]
fn root_releases_committed_objects() {
    let kit = in_memory_kit();
    for _ in 0..25 {
        insert_task(&kit, "released");
    }
    let id = insert_task(&kit, "edited");
    kit.save_and_wait(move |work| work.set(id, "done", true))
        .unwrap();

    let root = kit.root_context().unwrap();
    assert_eq!(root.cached_count().unwrap(), 0);
    assert!(!root.has_changes().unwrap());
    let edited = root.object(id).unwrap().unwrap();
    assert_eq!(edited.get("done"), Some(&AttributeValue::Boolean(true)));
    assert_eq!(edited.version(), 2);
}
