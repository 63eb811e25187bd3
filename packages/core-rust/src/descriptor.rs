//! Wiring descriptors resolved from artifact locators, and their validation.
//!
//! A descriptor lists the services an artifact contributes and the directed
//! relations between their declared ports. Validation happens once, at load
//! time: type tags on both ends of every relation must agree and no relation
//! may reference an undeclared service or port.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{ConfigMap, ServiceKind, TypeTag};

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Declared input or output port of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
}

impl PortSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: TypeTag::new(type_tag),
        }
    }
}

/// Declared service inside an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Identifier unique within the artifact.
    pub id: String,
    pub name: String,
    pub kind: ServiceKind,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Name under which the implementation is registered in the catalog.
    pub implementation: String,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub config: ConfigMap,
    /// Production period for scheduled sources, in milliseconds.
    #[serde(default)]
    pub period_ms: Option<u64>,
}

impl ServiceSpec {
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Whether `other` can replace this service without rewiring: same kind
    /// and identical port names and type tags.
    #[must_use]
    pub fn interface_matches(&self, other: &ServiceSpec) -> bool {
        self.kind == other.kind && self.inputs == other.inputs && self.outputs == other.outputs
    }
}

/// One side of a relation: a service id plus a port name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub service: String,
    pub port: String,
}

/// Directed producer -> consumer relation between two declared ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationSpec {
    pub from: EndpointRef,
    pub to: EndpointRef,
}

impl RelationSpec {
    #[must_use]
    pub fn new(from: (&str, &str), to: (&str, &str)) -> Self {
        Self {
            from: EndpointRef {
                service: from.0.to_string(),
                port: from.1.to_string(),
            },
            to: EndpointRef {
                service: to.0.to_string(),
                port: to.1.to_string(),
            },
        }
    }

    fn label(&self) -> String {
        format!(
            "{}.{}->{}.{}",
            self.from.service, self.from.port, self.to.service, self.to.port
        )
    }
}

/// Everything the core needs to register an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiringDescriptor {
    pub name: String,
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
}

/// Port direction, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// Declared wiring is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WiringError {
    #[error("{what} must not be empty")]
    EmptyIdentifier { what: &'static str },
    #[error("service '{service}' is declared more than once")]
    DuplicateService { service: String },
    #[error("service '{service}' declares {direction} '{port}' more than once")]
    DuplicatePort {
        service: String,
        port: String,
        direction: Direction,
    },
    #[error("{kind} service '{service}' cannot declare {direction} ports")]
    KindMismatch {
        service: String,
        kind: ServiceKind,
        direction: Direction,
    },
    #[error("relation references unknown service '{service}'")]
    UnknownService { service: String },
    #[error("service '{service}' has no {direction} named '{port}'")]
    UnknownPort {
        service: String,
        port: String,
        direction: Direction,
    },
    #[error("relation {relation} carries '{produced}' but the consumer expects '{expected}'")]
    TypeMismatch {
        relation: String,
        produced: TypeTag,
        expected: TypeTag,
    },
    #[error("relation {relation} is declared more than once")]
    DuplicateRelation { relation: String },
    #[error("service '{service}' uses unknown implementation '{implementation}'")]
    UnknownImplementation {
        service: String,
        implementation: String,
    },
    #[error("service '{service}' changed its interface and cannot be swapped in place")]
    IncompatibleInterface { service: String },
}

impl WiringDescriptor {
    #[must_use]
    pub fn service(&self, id: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Checks ids, port declarations and every relation.
    ///
    /// # Errors
    ///
    /// Returns the first `WiringError` found.
    pub fn validate(&self) -> Result<(), WiringError> {
        let mut by_id: HashMap<&str, &ServiceSpec> = HashMap::new();
        for spec in &self.services {
            if spec.id.is_empty() {
                return Err(WiringError::EmptyIdentifier { what: "service id" });
            }
            if by_id.insert(spec.id.as_str(), spec).is_some() {
                return Err(WiringError::DuplicateService {
                    service: spec.id.clone(),
                });
            }
            check_ports(spec, &spec.inputs, Direction::Input)?;
            check_ports(spec, &spec.outputs, Direction::Output)?;
        }

        let mut seen = HashSet::new();
        for relation in &self.relations {
            let producer = lookup(&by_id, &relation.from.service)?;
            let consumer = lookup(&by_id, &relation.to.service)?;

            let produced = producer
                .output(&relation.from.port)
                .ok_or_else(|| WiringError::UnknownPort {
                    service: producer.id.clone(),
                    port: relation.from.port.clone(),
                    direction: Direction::Output,
                })?;
            let expected = consumer
                .input(&relation.to.port)
                .ok_or_else(|| WiringError::UnknownPort {
                    service: consumer.id.clone(),
                    port: relation.to.port.clone(),
                    direction: Direction::Input,
                })?;

            if produced.type_tag != expected.type_tag {
                return Err(WiringError::TypeMismatch {
                    relation: relation.label(),
                    produced: produced.type_tag.clone(),
                    expected: expected.type_tag.clone(),
                });
            }
            if !seen.insert(relation) {
                return Err(WiringError::DuplicateRelation {
                    relation: relation.label(),
                });
            }
        }

        tracing::debug!(
            descriptor = %self.name,
            services = self.services.len(),
            relations = self.relations.len(),
            "wiring validated"
        );
        Ok(())
    }
}

fn lookup<'a>(
    by_id: &HashMap<&str, &'a ServiceSpec>,
    id: &str,
) -> Result<&'a ServiceSpec, WiringError> {
    by_id
        .get(id)
        .copied()
        .ok_or_else(|| WiringError::UnknownService {
            service: id.to_string(),
        })
}

fn check_ports(
    spec: &ServiceSpec,
    ports: &[PortSpec],
    direction: Direction,
) -> Result<(), WiringError> {
    if ports.is_empty() {
        return Ok(());
    }
    let allowed = match direction {
        Direction::Input => spec.kind.accepts_inputs(),
        Direction::Output => spec.kind.accepts_outputs(),
    };
    if !allowed {
        return Err(WiringError::KindMismatch {
            service: spec.id.clone(),
            kind: spec.kind,
            direction,
        });
    }
    let mut names = HashSet::new();
    for port in ports {
        if port.name.is_empty() {
            return Err(WiringError::EmptyIdentifier { what: "port name" });
        }
        if !names.insert(port.name.as_str()) {
            return Err(WiringError::DuplicatePort {
                service: spec.id.clone(),
                port: port.name.clone(),
                direction,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, out_type: &str) -> ServiceSpec {
        ServiceSpec {
            id: id.to_string(),
            name: id.to_string(),
            kind: ServiceKind::Source,
            version: default_version(),
            description: String::new(),
            implementation: "counter-source".to_string(),
            inputs: vec![],
            outputs: vec![PortSpec::new("out", out_type)],
            config: ConfigMap::new(),
            period_ms: None,
        }
    }

    fn sink(id: &str, in_type: &str) -> ServiceSpec {
        ServiceSpec {
            id: id.to_string(),
            name: id.to_string(),
            kind: ServiceKind::Sink,
            version: default_version(),
            description: String::new(),
            implementation: "logging-sink".to_string(),
            inputs: vec![PortSpec::new("in", in_type)],
            outputs: vec![],
            config: ConfigMap::new(),
            period_ms: None,
        }
    }

    fn pair(out_type: &str, in_type: &str) -> WiringDescriptor {
        WiringDescriptor {
            name: "pair".to_string(),
            services: vec![source("s1", out_type), sink("s2", in_type)],
            relations: vec![RelationSpec::new(("s1", "out"), ("s2", "in"))],
        }
    }

    #[test]
    fn matching_tags_validate() {
        assert_eq!(pair("Rec13", "Rec13").validate(), Ok(()));
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let err = pair("Rec13", "Rec1").validate().unwrap_err();
        assert!(matches!(
            err,
            WiringError::TypeMismatch { ref produced, ref expected, .. }
                if produced.as_str() == "Rec13" && expected.as_str() == "Rec1"
        ));
    }

    #[test]
    fn dangling_service_is_rejected() {
        let mut desc = pair("Rec13", "Rec13");
        desc.relations[0].to.service = "ghost".to_string();
        assert_eq!(
            desc.validate(),
            Err(WiringError::UnknownService {
                service: "ghost".to_string()
            })
        );
    }

    #[test]
    fn relation_must_leave_from_an_output() {
        let mut desc = pair("Rec13", "Rec13");
        desc.relations[0].from.port = "in".to_string();
        assert!(matches!(
            desc.validate(),
            Err(WiringError::UnknownPort {
                direction: Direction::Output,
                ..
            })
        ));
    }

    #[test]
    fn source_with_inputs_is_rejected() {
        let mut desc = pair("Rec13", "Rec13");
        desc.services[0].inputs.push(PortSpec::new("in", "Rec13"));
        assert!(matches!(
            desc.validate(),
            Err(WiringError::KindMismatch {
                kind: ServiceKind::Source,
                ..
            })
        ));
    }

    #[test]
    fn duplicate_service_ids_are_rejected() {
        let mut desc = pair("Rec13", "Rec13");
        desc.services.push(source("s1", "Rec13"));
        assert!(matches!(
            desc.validate(),
            Err(WiringError::DuplicateService { .. })
        ));
    }

    #[test]
    fn duplicate_relations_are_rejected() {
        let mut desc = pair("Rec13", "Rec13");
        desc.relations.push(desc.relations[0].clone());
        assert!(matches!(
            desc.validate(),
            Err(WiringError::DuplicateRelation { .. })
        ));
    }

    #[test]
    fn feedback_cycles_are_permitted() {
        let mut a = source("a", "T");
        a.kind = ServiceKind::Transform;
        a.inputs.push(PortSpec::new("in", "T"));
        let mut b = a.clone();
        b.id = "b".to_string();
        let desc = WiringDescriptor {
            name: "loop".to_string(),
            services: vec![a, b],
            relations: vec![
                RelationSpec::new(("a", "out"), ("b", "in")),
                RelationSpec::new(("b", "out"), ("a", "in")),
            ],
        };
        assert_eq!(desc.validate(), Ok(()));
    }

    #[test]
    fn deserializes_from_json_document() {
        let json = r#"{
            "name": "demo",
            "services": [
                {"id": "s1", "name": "Source", "kind": "SOURCE", "implementation": "counter-source",
                 "outputs": [{"name": "out", "type": "Rec13"}], "periodMs": 50},
                {"id": "s2", "name": "Sink", "kind": "SINK", "implementation": "logging-sink",
                 "inputs": [{"name": "in", "type": "Rec13"}], "config": {"verbose": true}}
            ],
            "relations": [{"from": {"service": "s1", "port": "out"}, "to": {"service": "s2", "port": "in"}}]
        }"#;
        let desc: WiringDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.services.len(), 2);
        assert_eq!(desc.services[0].period_ms, Some(50));
        assert_eq!(desc.services[1].version, "0.0.0");
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn interface_match_ignores_implementation_and_version() {
        let a = sink("s2", "Rec13");
        let mut b = a.clone();
        b.implementation = "other".to_string();
        b.version = "2.0.0".to_string();
        assert!(a.interface_matches(&b));
        b.inputs[0].type_tag = TypeTag::new("Rec1");
        assert!(!a.interface_matches(&b));
    }
}
