/// Runtime Envelopes
///
/// A runtime envelope names the interpreter a submission runs under and the
/// fixed process contract around it: `<interpreter> [args] <entry> <environment_id>`.
/// Envelopes are immutable versioned presets; the chosen id is recorded in logs.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Interpreter and staging conventions for one runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEnvelope {
    /// Envelope ID (e.g., "python3-v1")
    pub id: String,
    /// Interpreter executable path
    pub interpreter: String,
    /// Interpreter arguments (before the entry file)
    pub args: Vec<String>,
    /// Script extension the entry file must carry, without the dot
    pub script_extension: String,
    /// Name the entry is staged under
    pub canonical_entry: String,
    /// Fixed environment variables set for every run
    pub env: Vec<(String, String)>,
}

impl RuntimeEnvelope {
    /// Full argv tail after the interpreter for one run
    pub fn argv(&self, environment_id: &str) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(self.canonical_entry.clone());
        argv.push(environment_id.to_string());
        argv
    }

    pub fn accepts_entry(&self, entry: &str) -> bool {
        entry
            .rsplit_once('.')
            .map(|(stem, ext)| !stem.is_empty() && ext == self.script_extension)
            .unwrap_or(false)
    }
}

/// Registry of shipped runtime envelopes
pub struct RuntimePresets {
    envelopes: HashMap<String, RuntimeEnvelope>,
}

impl RuntimePresets {
    pub fn new() -> Self {
        let mut presets = Self {
            envelopes: HashMap::new(),
        };
        presets.register(python3_v1());
        presets
    }

    fn register(&mut self, envelope: RuntimeEnvelope) {
        self.envelopes.insert(envelope.id.clone(), envelope);
    }

    pub fn get(&self, id: &str) -> Option<&RuntimeEnvelope> {
        self.envelopes.get(id)
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.envelopes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for RuntimePresets {
    fn default() -> Self {
        Self::new()
    }
}

/// Default Python runtime: unbuffered, no bytecode writes
pub fn python3_v1() -> RuntimeEnvelope {
    RuntimeEnvelope {
        id: "python3-v1".to_string(),
        interpreter: "/usr/bin/python3".to_string(),
        args: vec!["-u".to_string(), "-B".to_string()],
        script_extension: "py".to_string(),
        canonical_entry: "submission.py".to_string(),
        env: vec![
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ],
    }
}
