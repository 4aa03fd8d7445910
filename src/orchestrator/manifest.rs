use super::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One locally managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Port the process listens on; checked and freed before start
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            port: None,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevManifest {
    pub services: Vec<ServiceSpec>,
}

impl DevManifest {
    pub fn from_json(raw: &str) -> Result<Self, OrchestratorError> {
        let manifest: DevManifest = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::ManifestInvalid(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Reject duplicate names, unknown dependencies and cycles.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut names = HashSet::new();
        for spec in &self.services {
            if spec.name.is_empty() || spec.command.is_empty() {
                return Err(OrchestratorError::ManifestInvalid(
                    "every service needs a name and a command".to_string(),
                ));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(OrchestratorError::ManifestInvalid(format!(
                    "duplicate service name '{}'",
                    spec.name
                )));
            }
        }
        for spec in &self.services {
            for dep in &spec.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(OrchestratorError::ManifestInvalid(format!(
                        "service '{}' depends on undeclared service '{}'",
                        spec.name, dep
                    )));
                }
            }
        }
        self.start_order().map(|_| ())
    }

    /// Service names with every dependency before its dependents.
    /// Ties keep manifest order.
    pub fn start_order(&self) -> Result<Vec<String>, OrchestratorError> {
        let by_name: HashMap<&str, &ServiceSpec> = self
            .services
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a ServiceSpec>,
            marks: &mut HashMap<&'a str, Mark>,
            order: &mut Vec<String>,
        ) -> Result<(), OrchestratorError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(OrchestratorError::Cycle(name.to_string())),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(&spec) = by_name.get(name) {
                for dep in &spec.depends_on {
                    visit(dep.as_str(), by_name, marks, order)?;
                }
            }
            marks.insert(name, Mark::Done);
            order.push(name.to_string());
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut order = Vec::with_capacity(self.services.len());
        for spec in &self.services {
            visit(spec.name.as_str(), &by_name, &mut marks, &mut order)?;
        }
        Ok(order)
    }
}
