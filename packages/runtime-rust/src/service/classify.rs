//! Call classification: converts `(name, positional JSON args)` into typed
//! `Operation` variants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowyard_core::{ArtifactId, ClockSource, ConfigMap, ServiceId, ServiceState, SystemClock};
use serde_json::Value as Json;

use super::operation::{
    service_names, CallerOrigin, ClassifyError, Operation, OperationContext,
};
use crate::config::RuntimeConfig;

// ---------------------------------------------------------------------------
// OperationService
// ---------------------------------------------------------------------------

/// Classifies named calls into typed `Operation` variants.
///
/// Each call gets a unique call id and the configured default timeout.
pub struct OperationService {
    config: Arc<RuntimeConfig>,
    clock: Arc<dyn ClockSource>,
    call_id_counter: AtomicU64,
}

impl OperationService {
    #[must_use]
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            call_id_counter: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    fn next_call_id(&self) -> u64 {
        self.call_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn make_ctx(&self, service_name: &'static str, caller_origin: CallerOrigin) -> OperationContext {
        let mut ctx = OperationContext::new(
            self.next_call_id(),
            service_name,
            self.clock.now(),
            self.config.default_operation_timeout_ms,
        );
        ctx.caller_origin = caller_origin;
        ctx
    }

    /// Classify a named call.
    ///
    /// Names are the camelCase manager operation names (`addArtifact`,
    /// `startService`, `switchTo`, ...). Arguments are positional.
    ///
    /// # Errors
    ///
    /// `ClassifyError::UnknownOperation` for an unrecognized name,
    /// `ClassifyError::InvalidArguments` for a wrong argument count or type.
    pub fn classify(
        &self,
        name: &str,
        args: &[Json],
        caller_origin: CallerOrigin,
    ) -> Result<Operation, ClassifyError> {
        use service_names::{LIFECYCLE, REGISTRY, TOPOLOGY};

        let op = match name {
            // ----- registry -----
            "addArtifact" => {
                let mut a = Args::new("addArtifact", args, 1)?;
                Operation::AddArtifact {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                    locator: a.string()?,
                }
            }
            "removeArtifact" => {
                let mut a = Args::new("removeArtifact", args, 1)?;
                Operation::RemoveArtifact {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                    artifact: a.artifact()?,
                }
            }
            "getArtifact" => {
                let mut a = Args::new("getArtifact", args, 1)?;
                Operation::GetArtifact {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                    artifact: a.artifact()?,
                }
            }
            "getArtifacts" => {
                Args::new("getArtifacts", args, 0)?;
                Operation::GetArtifacts {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                }
            }
            "getArtifactIds" => {
                Args::new("getArtifactIds", args, 0)?;
                Operation::GetArtifactIds {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                }
            }
            "getService" => {
                let mut a = Args::new("getService", args, 1)?;
                Operation::GetService {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                    service: a.service()?,
                }
            }
            "getServices" => {
                Args::new("getServices", args, 0)?;
                Operation::GetServices {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                }
            }
            "getServiceIds" => {
                Args::new("getServiceIds", args, 0)?;
                Operation::GetServiceIds {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                }
            }
            "getState" => {
                let mut a = Args::new("getState", args, 1)?;
                Operation::GetState {
                    ctx: self.make_ctx(REGISTRY, caller_origin),
                    service: a.service()?,
                }
            }

            // ----- lifecycle -----
            "startService" => {
                let mut a = Args::new("startService", args, 1)?;
                Operation::StartService {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                }
            }
            "stopService" => {
                let mut a = Args::new("stopService", args, 1)?;
                Operation::StopService {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                }
            }
            "passivate" => {
                let mut a = Args::new("passivate", args, 1)?;
                Operation::Passivate {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                }
            }
            "activate" => {
                let mut a = Args::new("activate", args, 1)?;
                Operation::Activate {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                }
            }
            "reconfigure" => {
                let mut a = Args::new("reconfigure", args, 2)?;
                Operation::Reconfigure {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                    config: a.decode::<ConfigMap>()?,
                }
            }
            "setState" => {
                let mut a = Args::new("setState", args, 2)?;
                Operation::SetState {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    service: a.service()?,
                    state: a.decode::<ServiceState>()?,
                }
            }
            "startArtifact" => {
                let mut a = Args::new("startArtifact", args, 1)?;
                Operation::StartArtifact {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    artifact: a.artifact()?,
                }
            }
            "stopArtifact" => {
                let mut a = Args::new("stopArtifact", args, 1)?;
                Operation::StopArtifact {
                    ctx: self.make_ctx(LIFECYCLE, caller_origin),
                    artifact: a.artifact()?,
                }
            }

            // ----- topology -----
            "clone" => {
                let mut a = Args::new("clone", args, 2)?;
                Operation::Clone {
                    ctx: self.make_ctx(TOPOLOGY, caller_origin),
                    artifact: a.artifact()?,
                    service: a.service()?,
                }
            }
            "migrate" => {
                let mut a = Args::new("migrate", args, 2)?;
                Operation::Migrate {
                    ctx: self.make_ctx(TOPOLOGY, caller_origin),
                    artifact: a.artifact()?,
                    service: a.service()?,
                }
            }
            "switchTo" => {
                let mut a = Args::new("switchTo", args, 3)?;
                Operation::SwitchTo {
                    ctx: self.make_ctx(TOPOLOGY, caller_origin),
                    artifact: a.artifact()?,
                    service: a.service()?,
                    implementation: a.string()?,
                }
            }
            "update" => {
                let mut a = Args::new("update", args, 2)?;
                Operation::Update {
                    ctx: self.make_ctx(TOPOLOGY, caller_origin),
                    artifact: a.artifact()?,
                    service: a.service()?,
                }
            }

            other => {
                return Err(ClassifyError::UnknownOperation {
                    name: other.to_string(),
                })
            }
        };
        Ok(op)
    }
}

// ---------------------------------------------------------------------------
// Positional argument reader
// ---------------------------------------------------------------------------

struct Args<'a> {
    operation: &'static str,
    values: std::slice::Iter<'a, Json>,
    position: usize,
}

impl<'a> Args<'a> {
    fn new(operation: &'static str, args: &'a [Json], arity: usize) -> Result<Self, ClassifyError> {
        if args.len() != arity {
            return Err(ClassifyError::InvalidArguments {
                operation,
                reason: format!("expected {arity} argument(s), got {}", args.len()),
            });
        }
        Ok(Self {
            operation,
            values: args.iter(),
            position: 0,
        })
    }

    fn invalid(&self, reason: String) -> ClassifyError {
        ClassifyError::InvalidArguments {
            operation: self.operation,
            reason,
        }
    }

    fn next(&mut self) -> Result<&'a Json, ClassifyError> {
        self.position += 1;
        let position = self.position;
        self.values
            .next()
            .ok_or_else(|| self.invalid(format!("missing argument {position}")))
    }

    fn string(&mut self) -> Result<String, ClassifyError> {
        let value = self.next()?;
        match value.as_str() {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(self.invalid(format!(
                "argument {} must be a non-empty string, got {value}",
                self.position
            ))),
        }
    }

    fn artifact(&mut self) -> Result<ArtifactId, ClassifyError> {
        self.string().map(ArtifactId::new)
    }

    fn service(&mut self) -> Result<ServiceId, ClassifyError> {
        self.string().map(ServiceId::new)
    }

    fn decode<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, ClassifyError> {
        let value = self.next()?;
        serde_json::from_value(value.clone())
            .map_err(|err| self.invalid(format!("argument {}: {err}", self.position)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use flowyard_core::{ManualClock, Value};
    use serde_json::json;

    use super::*;

    fn make_service() -> OperationService {
        let config = Arc::new(RuntimeConfig {
            default_operation_timeout_ms: 5000,
            ..RuntimeConfig::default()
        });
        OperationService::new(config).with_clock(Arc::new(ManualClock::new(42)))
    }

    #[test]
    fn add_artifact_routes_to_registry() {
        let svc = make_service();
        let op = svc
            .classify("addArtifact", &[json!("mem://demo")], CallerOrigin::Remote)
            .unwrap();

        assert_eq!(op.ctx().service_name, service_names::REGISTRY);
        assert_eq!(op.ctx().call_timeout_ms, 5000);
        assert_eq!(op.ctx().issued_at, 42);
        assert_eq!(op.ctx().caller_origin, CallerOrigin::Remote);
        assert!(matches!(op, Operation::AddArtifact { locator, .. } if locator == "mem://demo"));
    }

    #[test]
    fn lifecycle_names_route_to_lifecycle() {
        let svc = make_service();
        for name in ["startService", "stopService", "passivate", "activate"] {
            let op = svc.classify(name, &[json!("a/s1")], CallerOrigin::Local).unwrap();
            assert_eq!(op.ctx().service_name, service_names::LIFECYCLE);
            assert_eq!(op.name(), name);
        }
    }

    #[test]
    fn reconfigure_decodes_config_map() {
        let svc = make_service();
        let op = svc
            .classify(
                "reconfigure",
                &[json!("a/s1"), json!({"step": 3, "label": "x"})],
                CallerOrigin::Local,
            )
            .unwrap();
        let Operation::Reconfigure { config, .. } = op else {
            panic!("expected reconfigure");
        };
        assert_eq!(config["step"], Value::Int(3));
    }

    #[test]
    fn set_state_decodes_upper_case_state() {
        let svc = make_service();
        let op = svc
            .classify("setState", &[json!("a/s1"), json!("PASSIVATED")], CallerOrigin::Local)
            .unwrap();
        assert!(matches!(
            op,
            Operation::SetState {
                state: ServiceState::Passivated,
                ..
            }
        ));

        let err = svc
            .classify("setState", &[json!("a/s1"), json!("SLEEPING")], CallerOrigin::Local)
            .unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidArguments { operation: "setState", .. }));
    }

    #[test]
    fn switch_to_takes_three_arguments() {
        let svc = make_service();
        let op = svc
            .classify(
                "switchTo",
                &[json!("a"), json!("a/s1"), json!("passthrough")],
                CallerOrigin::Local,
            )
            .unwrap();
        assert_eq!(op.ctx().service_name, service_names::TOPOLOGY);

        let err = svc
            .classify("switchTo", &[json!("a"), json!("a/s1")], CallerOrigin::Local)
            .unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidArguments { .. }));
    }

    #[test]
    fn rejects_unknown_names_and_bad_types() {
        let svc = make_service();
        assert_eq!(
            svc.classify("explode", &[], CallerOrigin::Local).unwrap_err(),
            ClassifyError::UnknownOperation {
                name: "explode".into()
            }
        );
        assert!(svc
            .classify("getArtifact", &[json!(5)], CallerOrigin::Local)
            .is_err());
        assert!(svc
            .classify("getArtifact", &[json!("")], CallerOrigin::Local)
            .is_err());
        assert!(svc
            .classify("getArtifacts", &[json!("extra")], CallerOrigin::Local)
            .is_err());
    }

    #[test]
    fn call_ids_are_unique_and_monotonic() {
        let svc = make_service();
        let ids: Vec<u64> = (0..5)
            .map(|_| {
                svc.classify("getArtifactIds", &[], CallerOrigin::Local)
                    .unwrap()
                    .ctx()
                    .call_id
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
