//! Process-wide model registry.
//!
//! Components register the models they ship; setups without an explicit
//! schema use the merge of everything registered here.

use super::schema::{Schema, SchemaError};
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static REGISTERED_MODELS: Lazy<Mutex<Vec<Schema>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Registers one model. Registering an identical model twice is a no-op.
pub fn register_model(model: Schema) {
    let mut models = REGISTERED_MODELS.lock();
    if models.contains(&model) {
        return;
    }
    debug!(
        "event=model_register module=model status=ok version={} entities={}",
        model.version,
        model.entities.len()
    );
    models.push(model);
}

/// Returns the merge of every registered model.
pub fn merged_registered_models() -> Result<Schema, SchemaError> {
    let models = REGISTERED_MODELS.lock();
    Schema::merged(models.iter())
}
