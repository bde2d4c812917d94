use serde_json::{Map as JsonMap, Value};

/// Nested name/value record of how a job was run, built up by its worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvenanceTree {
    root: JsonMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvenanceConflict {
    #[error("empty provenance path")]
    EmptyPath,
    #[error("node `{0}` is not an object")]
    NotAnObject(String),
}

impl ProvenanceTree {
    /// Seeds the tree with existing provenance; only a JSON object can be extended.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(root) => Some(Self { root }),
            _ => None,
        }
    }

    /// Stores `value` under `path`, creating the intermediate objects.
    /// A path that leads through a scalar is refused and leaves the tree intact.
    pub fn add(&mut self, path: &[String], value: String) -> Result<(), ProvenanceConflict> {
        let Some((last, prefix)) = path.split_last() else {
            return Err(ProvenanceConflict::EmptyPath);
        };
        let mut current = &mut self.root;
        for item in prefix {
            let node = current
                .entry(item.clone())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            match node {
                Value::Object(map) => current = map,
                _ => return Err(ProvenanceConflict::NotAnObject(item.clone())),
            }
        }
        current.insert(last.clone(), Value::String(value));
        Ok(())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}
