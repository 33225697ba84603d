//! Astarte interface descriptors.
//!
//! A descriptor declares the named endpoints of an interface together with
//! their type and quality-of-service metadata. Descriptors are registered
//! with the device client before connecting and are constant afterwards.

use serde::{Deserialize, Serialize};

pub const TESTER_INTERFACE: &str = "com.astarte.Tester";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub interface_name: String,
    pub version_major: u32,
    pub version_minor: u32,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
    pub ownership: Ownership,
    pub aggregation: Aggregation,
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub endpoint: String,
    #[serde(rename = "type")]
    pub mapping_type: MappingType,
    pub reliability: Reliability,
    pub retention: Retention,
    pub expiry: u32,
    pub database_retention_policy: DatabaseRetentionPolicy,
    pub database_retention_ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Datastream,
    Properties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Device,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Individual,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    Integer,
    LongInteger,
    Double,
    Boolean,
    String,
    BinaryBlob,
    DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Unreliable,
    Guaranteed,
    Unique,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    Discard,
    Volatile,
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseRetentionPolicy {
    NoTtl,
    UseTtl,
}

impl Interface {
    /// The single telemetry interface published by this simulator: an
    /// object-aggregated datastream with three integer endpoints.
    pub fn tester() -> Self {
        let integer_endpoint = |endpoint: &str| Mapping {
            endpoint: endpoint.to_string(),
            mapping_type: MappingType::Integer,
            reliability: Reliability::Unique,
            retention: Retention::Volatile,
            expiry: 60,
            database_retention_policy: DatabaseRetentionPolicy::UseTtl,
            database_retention_ttl: 28800,
        };
        Interface {
            interface_name: TESTER_INTERFACE.to_string(),
            version_major: 0,
            version_minor: 1,
            interface_type: InterfaceType::Datastream,
            ownership: Ownership::Device,
            aggregation: Aggregation::Object,
            mappings: vec![
                integer_endpoint("/timestamp"),
                integer_endpoint("/counter"),
                integer_endpoint("/random"),
            ],
        }
    }
}
