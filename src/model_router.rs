//! Resolves a logical phase identifier to a concrete backend/model/params
//! triple, and runs prompts against that backend.
//!
//! A small trait, `ModelBackend`, stands between "one of several configured
//! backends selected per phase" and a subprocess-plus-result-file contract
//! implemented by `CliModelBackend::run`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KbaError;

/// Capabilities a backend advertises. A resolution requiring a capability the
/// chosen backend lacks fails with `KbaError::Capability` rather than
/// silently falling back to another backend.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BackendCapabilities {
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub embedding_dimensions: Option<u32>,
}

/// The resolved target for a phase: which backend to call, with which model
/// and parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTarget {
    pub backend_name: String,
    pub model: String,
    pub params: HashMap<String, serde_json::Value>,
}

/// A partial override of a `ResolvedTarget`, applied on top of the
/// configured default for a single `resolve` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolveOverride {
    pub backend_name: Option<String>,
    pub model: Option<String>,
    pub params: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackendResult {
    pub output: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
}

/// A single configured backend entry: name, required capability for the
/// phase it's bound to, and how to reach it.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendEntry {
    pub name: String,
    pub model: String,
    pub capabilities: BackendCapabilities,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhaseRequirement {
    pub requires_streaming: bool,
    pub requires_vision: bool,
    pub requires_embedding: bool,
}

/// Maps phase identifiers to backend entries and the capability a phase
/// demands of whichever backend serves it. Config-driven: no implicit
/// fallback across backends, matching the selection policy.
#[derive(Clone, Debug, Default)]
pub struct ModelRouter {
    defaults: HashMap<String, BackendEntry>,
    requirements: HashMap<String, PhaseRequirement>,
}

impl ModelRouter {
    pub fn new() -> Self {
        ModelRouter::default()
    }

    pub fn register_phase(&mut self, phase: impl Into<String>, backend: BackendEntry, requirement: PhaseRequirement) {
        let phase = phase.into();
        self.defaults.insert(phase.clone(), backend);
        self.requirements.insert(phase, requirement);
    }

    /// Resolve `phase` to a concrete target, applying `override_` on top of
    /// the configured default. Fails with `KbaError::Capability` if the
    /// resulting backend cannot satisfy the phase's declared requirement.
    pub fn resolve(&self, phase: &str, override_: Option<ResolveOverride>) -> Result<ResolvedTarget, KbaError> {
        let default = self
            .defaults
            .get(phase)
            .ok_or_else(|| KbaError::ModelRouter(format!("no backend configured for phase {phase}")))?;
        let requirement = self.requirements.get(phase).cloned().unwrap_or_default();

        let override_ = override_.unwrap_or_default();
        let backend_name = override_.backend_name.unwrap_or_else(|| default.name.clone());
        let model = override_.model.unwrap_or_else(|| default.model.clone());
        let params = override_.params.unwrap_or_default();

        let capabilities = if backend_name == default.name {
            default.capabilities
        } else {
            // An override naming a different backend must be registered
            // under some phase to know its capabilities; without that we
            // can't verify it, so refuse rather than silently trusting it.
            return Err(KbaError::ModelRouter(format!(
                "override backend {backend_name} is not a known registered backend"
            )));
        };

        if requirement.requires_streaming && !capabilities.supports_streaming {
            return Err(KbaError::Capability {
                backend: backend_name,
                capability: "streaming".to_string(),
                phase: phase.to_string(),
            });
        }
        if requirement.requires_vision && !capabilities.supports_vision {
            return Err(KbaError::Capability {
                backend: backend_name,
                capability: "vision".to_string(),
                phase: phase.to_string(),
            });
        }
        if requirement.requires_embedding && capabilities.embedding_dimensions.is_none() {
            return Err(KbaError::Capability {
                backend: backend_name,
                capability: "embedding".to_string(),
                phase: phase.to_string(),
            });
        }

        Ok(ResolvedTarget { backend_name, model, params })
    }
}

/// Runs a resolved target against its backend. A trait object so pipeline
/// tests can substitute a mock rather than spawning a real subprocess.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn run(&self, target: &ResolvedTarget, prompt: &str, timeout: Duration) -> Result<BackendResult, KbaError>;
}

/// Spawns a configured CLI tool as a subprocess and reads its result from a
/// JSON file, taking the binary name and args template per backend rather
/// than a single hardcoded tool.
pub struct CliModelBackend {
    pub binary_name: String,
    pub extra_args: Vec<String>,
    pub result_dir: std::path::PathBuf,
}

impl CliModelBackend {
    pub fn new(binary_name: impl Into<String>, extra_args: Vec<String>, result_dir: std::path::PathBuf) -> Self {
        CliModelBackend {
            binary_name: binary_name.into(),
            extra_args,
            result_dir,
        }
    }

    fn result_path(&self, target: &ResolvedTarget) -> std::path::PathBuf {
        self.result_dir.join(format!("{}.result.json", target.model))
    }
}

#[async_trait]
impl ModelBackend for CliModelBackend {
    async fn run(&self, target: &ResolvedTarget, prompt: &str, timeout: Duration) -> Result<BackendResult, KbaError> {
        let result_path = self.result_path(target);

        match tokio::fs::remove_file(&result_path).await {
            Ok(()) => tracing::warn!(path = %result_path.display(), "stale result file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KbaError::Storage(e.to_string())),
        }

        let mut cmd = tokio::process::Command::new(&self.binary_name);
        cmd.args(&self.extra_args)
            .arg("--model")
            .arg(&target.model)
            .arg("--prompt")
            .arg(prompt)
            .arg("--result-path")
            .arg(&result_path);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| KbaError::Other(format!("failed to spawn {}: {e}", self.binary_name)))?;

        let wait_result = tokio::time::timeout(timeout, child.wait()).await;
        let status = match wait_result {
            Err(_) => {
                let _ = child.kill().await;
                return Err(KbaError::Timeout(timeout));
            }
            Ok(status) => status.map_err(|e| KbaError::Other(e.to_string()))?,
        };

        if !status.success() && !result_path.exists() {
            return Err(KbaError::Other(format!("{} exited with {:?} and produced no result", self.binary_name, status.code())));
        }

        read_result_file(&result_path).await
    }
}

async fn read_result_file(path: &Path) -> Result<BackendResult, KbaError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| KbaError::Storage(format!("result file {}: {e}", path.display())))?;
    let result = serde_json::from_str(&contents).map_err(|e| KbaError::Data(format!("invalid result JSON: {e}")))?;
    let _ = tokio::fs::remove_file(path).await;
    Ok(result)
}

/// Mock backend for pipeline tests; returns a predetermined sequence of
/// results, mirroring `MockAgentRunner`.
pub struct MockModelBackend {
    results: tokio::sync::Mutex<Vec<Result<BackendResult, KbaError>>>,
}

impl MockModelBackend {
    pub fn new(mut results: Vec<Result<BackendResult, KbaError>>) -> Self {
        results.reverse();
        MockModelBackend {
            results: tokio::sync::Mutex::new(results),
        }
    }
}

#[async_trait]
impl ModelBackend for MockModelBackend {
    async fn run(&self, _target: &ResolvedTarget, _prompt: &str, _timeout: Duration) -> Result<BackendResult, KbaError> {
        let mut results = self.results.lock().await;
        results.pop().unwrap_or_else(|| Err(KbaError::Other("MockModelBackend: no more results in sequence".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, vision: bool) -> BackendEntry {
        BackendEntry {
            name: name.to_string(),
            model: format!("{name}-default"),
            capabilities: BackendCapabilities {
                supports_streaming: false,
                supports_vision: vision,
                embedding_dimensions: None,
            },
        }
    }

    #[test]
    fn resolve_returns_configured_default() {
        let mut router = ModelRouter::new();
        router.register_phase("vision", backend("ollama", true), PhaseRequirement::default());

        let target = router.resolve("vision", None).unwrap();
        assert_eq!(target.backend_name, "ollama");
        assert_eq!(target.model, "ollama-default");
    }

    #[test]
    fn resolve_fails_capability_mismatch() {
        let mut router = ModelRouter::new();
        router.register_phase(
            "vision",
            backend("ollama", false),
            PhaseRequirement {
                requires_vision: true,
                ..Default::default()
            },
        );

        let err = router.resolve("vision", None).unwrap_err();
        assert!(matches!(err, KbaError::Capability { .. }));
    }

    #[test]
    fn resolve_unknown_phase_errors() {
        let router = ModelRouter::new();
        let err = router.resolve("chat", None).unwrap_err();
        assert!(matches!(err, KbaError::ModelRouter(_)));
    }

    #[test]
    fn override_model_keeps_default_backend_capabilities() {
        let mut router = ModelRouter::new();
        router.register_phase("chat", backend("ollama", false), PhaseRequirement::default());

        let target = router
            .resolve(
                "chat",
                Some(ResolveOverride {
                    model: Some("llama3.1".to_string()),
                    ..Default::default()
                }),
            )
            .unwrap();
        assert_eq!(target.backend_name, "ollama");
        assert_eq!(target.model, "llama3.1");
    }

    #[tokio::test]
    async fn mock_backend_returns_sequence_in_order() {
        let backend = MockModelBackend::new(vec![
            Ok(BackendResult { output: "first".to_string(), structured: None }),
            Ok(BackendResult { output: "second".to_string(), structured: None }),
        ]);
        let target = ResolvedTarget {
            backend_name: "mock".to_string(),
            model: "mock-model".to_string(),
            params: HashMap::new(),
        };

        let first = backend.run(&target, "p", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.output, "first");
        let second = backend.run(&target, "p", Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.output, "second");
    }
}
