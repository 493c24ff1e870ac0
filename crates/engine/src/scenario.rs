//! Sequence files – load scan sequences from YAML.
//!
//! ```yaml
//! name: temperature sweep
//! steps:
//!   - kind: set
//!     params: { channel: shutter, value: 1, wait: false }
//!   - kind: loop
//!     params: { channel: temp, start: 20, end: 30, step: 5, timeout: 60 }
//!     body:
//!       - kind: delay
//!         params: { seconds: 2 }
//! ```
//!
//! Loading only checks the document shape. Kinds and parameters are checked
//! when the sequence is handed to [`crate::Sequencer::new`].

use crate::types::Sequence;
use std::path::Path;

/// Load a sequence from a YAML string.
pub fn load_sequence(yaml: &str) -> Result<Sequence, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse sequence YAML: {}", e))
}

pub fn load_sequence_file(path: &Path) -> Result<Sequence, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut sequence = load_sequence(&text)?;
    if sequence.name.is_none() {
        sequence.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from);
    }
    Ok(sequence)
}
