//! Checkpoint normalization.
//!
//! Training wraps the network in outer modules, so raw checkpoint keys carry
//! framework prefixes ("model.", "net.") that the canonical parameter table
//! does not. Normalization strips at most one prefix per key, validates the
//! result against the architecture, and saves it as a safetensors file that
//! loads without any further key surgery.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::config::CrepeConfig;
use crate::error::{CrepeError, CrepeResult};
use crate::model::CrepeNet;

/// Key prefixes stripped during normalization, in precedence order. Only the
/// first matching rule applies, and it applies once.
pub const REMAP_PREFIXES: [&str; 2] = ["model.", "net."];

/// Canonicalize one raw checkpoint key.
///
/// `"model.net.fc.weight"` becomes `"net.fc.weight"`; a second call is then
/// needed to reach `"fc.weight"`, which normalization deliberately does not
/// do. Keys without a known prefix pass through unchanged, so the function
/// is idempotent on already-canonical keys.
pub fn canonicalize_key(key: &str) -> &str {
    for prefix in REMAP_PREFIXES {
        if let Some(stripped) = key.strip_prefix(prefix) {
            return stripped;
        }
    }
    key
}

/// Canonicalize every key in a raw state mapping.
///
/// Two raw keys collapsing onto the same canonical key is a corrupt
/// checkpoint and an error.
pub fn normalize_state_dict(
    raw: HashMap<String, Tensor>,
) -> CrepeResult<HashMap<String, Tensor>> {
    let mut canonical = HashMap::with_capacity(raw.len());
    for (key, tensor) in raw {
        let name = canonicalize_key(&key).to_string();
        if canonical.insert(name.clone(), tensor).is_some() {
            return Err(CrepeError::checkpoint(format!(
                "keys collide after prefix stripping: {name}"
            )));
        }
    }
    Ok(canonical)
}

/// Read the `state_dict` mapping out of a pickled training checkpoint.
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> CrepeResult<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let entries = candle_core::pickle::read_all_with_key(path, Some("state_dict"))
        .map_err(|e| CrepeError::checkpoint(format!("{}: {e}", path.display())))?;
    if entries.is_empty() {
        return Err(CrepeError::checkpoint(format!(
            "{}: checkpoint has no state_dict entries",
            path.display()
        )));
    }
    debug!(path = %path.display(), tensors = entries.len(), "read raw checkpoint");
    Ok(entries.into_iter().collect())
}

/// Save a canonical weight mapping as a safetensors file.
///
/// Batch-norm `num_batches_tracked` counters are dropped: they are training
/// bookkeeping and safetensors has no scalar-i64 use for them here.
pub fn save_canonical<P: AsRef<Path>>(
    weights: &HashMap<String, Tensor>,
    path: P,
) -> CrepeResult<()> {
    let filtered: HashMap<String, Tensor> = weights
        .iter()
        .filter(|(name, _)| !name.ends_with(".num_batches_tracked"))
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&filtered, path)?;
    Ok(())
}

/// Load a canonical weight mapping from a safetensors file.
pub fn load_canonical<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> CrepeResult<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, device)?)
}

/// Convert a raw training checkpoint into the canonical weight file.
///
/// Reads the pickled checkpoint, strips wrapper prefixes, validates the
/// result against the capacity tier's parameter table by constructing the
/// model, and writes the validated mapping to `output`.
pub fn convert_checkpoint<P: AsRef<Path>, Q: AsRef<Path>>(
    checkpoint: P,
    output: Q,
    config: &CrepeConfig,
) -> CrepeResult<()> {
    let raw = read_checkpoint(&checkpoint)?;
    let canonical = normalize_state_dict(raw)?;

    // Validation only; the constructed model is discarded.
    let model = CrepeNet::from_weights(config, &canonical)?;
    let state = model.state_dict()?;
    save_canonical(&state, &output)?;

    info!(
        checkpoint = %checkpoint.as_ref().display(),
        output = %output.as_ref().display(),
        capacity = %config.capacity,
        tensors = state.len(),
        "converted checkpoint"
    );
    Ok(())
}
