//! Versioned (de)serialization of API objects
//!
//! Reads accept the current version and the legacy `v1alpha1`; writes always
//! emit the current version. Unknown spec fields survive a read-modify-write
//! only when the input was already the current version.

use crate::error::{CoreError, Result};
use crate::model::{
    API_VERSION, Cluster, ClusterSpec, ClusterStatus, InstanceGroup, InstanceGroupSpec,
    LEGACY_API_VERSION, ObjectMeta,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An object stored in the registry
pub trait ApiObject: Sized {
    const KIND: &'static str;
    type Spec: Serialize + DeserializeOwned + Default;

    fn from_parts(metadata: ObjectMeta, spec: Self::Spec) -> Self;
    fn metadata(&self) -> &ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn clear_unknown_fields(spec: &mut Self::Spec);
}

impl ApiObject for Cluster {
    const KIND: &'static str = "Cluster";
    type Spec = ClusterSpec;

    fn from_parts(metadata: ObjectMeta, spec: ClusterSpec) -> Self {
        Cluster { metadata, spec }
    }
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn spec(&self) -> &ClusterSpec {
        &self.spec
    }
    fn clear_unknown_fields(spec: &mut ClusterSpec) {
        spec.unknown_fields.clear();
    }
}

impl ApiObject for InstanceGroup {
    const KIND: &'static str = "InstanceGroup";
    type Spec = InstanceGroupSpec;

    fn from_parts(metadata: ObjectMeta, spec: InstanceGroupSpec) -> Self {
        InstanceGroup { metadata, spec }
    }
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn spec(&self) -> &InstanceGroupSpec {
        &self.spec
    }
    fn clear_unknown_fields(spec: &mut InstanceGroupSpec) {
        spec.unknown_fields.clear();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOut<'a, S> {
    api_version: &'a str,
    kind: &'a str,
    metadata: &'a ObjectMeta,
    spec: &'a S,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeIn {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Option<serde_yaml::Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEnvelope {
    api_version: String,
    kind: String,
    #[serde(default)]
    status: ClusterStatus,
}

/// Serialize to YAML at the current version
pub fn encode<T: ApiObject>(obj: &T) -> Result<Vec<u8>> {
    let out = serde_yaml::to_string(&EnvelopeOut {
        api_version: API_VERSION,
        kind: T::KIND,
        metadata: obj.metadata(),
        spec: obj.spec(),
    })?;
    Ok(out.into_bytes())
}

/// Serialize to pretty JSON at the current version
pub fn encode_json<T: ApiObject>(obj: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(&EnvelopeOut {
        api_version: API_VERSION,
        kind: T::KIND,
        metadata: obj.metadata(),
        spec: obj.spec(),
    })?)
}

/// Parse a YAML or JSON document of kind `T::KIND`
pub fn decode<T: ApiObject>(data: &[u8]) -> Result<T> {
    let envelope: EnvelopeIn = serde_yaml::from_slice(data)?;
    decode_envelope(envelope)
}

fn decode_envelope<T: ApiObject>(envelope: EnvelopeIn) -> Result<T> {
    if envelope.kind != T::KIND {
        return Err(CoreError::UnexpectedKind {
            expected: T::KIND.to_string(),
            found: envelope.kind,
        });
    }
    let legacy = match envelope.api_version.as_str() {
        API_VERSION => false,
        LEGACY_API_VERSION => true,
        _ => {
            return Err(CoreError::UnsupportedApiVersion {
                api_version: envelope.api_version,
                kind: envelope.kind,
            });
        }
    };
    let mut spec: T::Spec = match envelope.spec {
        Some(value) => serde_yaml::from_value(value)?,
        None => T::Spec::default(),
    };
    if legacy {
        T::clear_unknown_fields(&mut spec);
    }
    Ok(T::from_parts(envelope.metadata, spec))
}

pub fn encode_status(status: &ClusterStatus) -> Result<Vec<u8>> {
    let out = serde_yaml::to_string(&StatusEnvelope {
        api_version: API_VERSION.to_string(),
        kind: "ClusterStatus".to_string(),
        status: status.clone(),
    })?;
    Ok(out.into_bytes())
}

pub fn decode_status(data: &[u8]) -> Result<ClusterStatus> {
    let envelope: StatusEnvelope = serde_yaml::from_slice(data)?;
    if envelope.api_version != API_VERSION && envelope.api_version != LEGACY_API_VERSION {
        return Err(CoreError::UnsupportedApiVersion {
            api_version: envelope.api_version,
            kind: envelope.kind,
        });
    }
    Ok(envelope.status)
}

/// One object from a multi-document manifest
#[derive(Debug, Clone, PartialEq)]
pub enum AnyObject {
    Cluster(Cluster),
    InstanceGroup(InstanceGroup),
}

/// Parse a `---`-separated manifest of clusters and instance groups
pub fn decode_documents(data: &[u8]) -> Result<Vec<AnyObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(data) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let envelope: EnvelopeIn = serde_yaml::from_value(value)?;
        let object = match envelope.kind.as_str() {
            "Cluster" => AnyObject::Cluster(decode_envelope(envelope)?),
            "InstanceGroup" => AnyObject::InstanceGroup(decode_envelope(envelope)?),
            other => {
                return Err(CoreError::UnexpectedKind {
                    expected: "Cluster or InstanceGroup".to_string(),
                    found: other.to_string(),
                });
            }
        };
        objects.push(object);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSubnetSpec, InstanceGroupRole, ProviderId, SubnetType};

    fn sample_cluster() -> Cluster {
        let mut c = Cluster::new("minimal.example.com");
        c.spec.cloud_provider = Some(ProviderId::Aws);
        c.spec.kubernetes_version = Some("1.31.4".to_string());
        c.spec.network_cidr = Some("172.20.0.0/16".to_string());
        c.spec.subnets.push(ClusterSubnetSpec {
            name: "us-test-1a".to_string(),
            zone: "us-test-1a".to_string(),
            cidr: Some("172.20.32.0/19".to_string()),
            subnet_type: SubnetType::Public,
            ..Default::default()
        });
        c
    }

    #[test]
    fn test_cluster_round_trip() {
        let c = sample_cluster();
        let data = encode(&c).unwrap();
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.starts_with("apiVersion: kops.k8s.io/v1alpha2\nkind: Cluster\n"));
        assert!(text.contains("networkCIDR: 172.20.0.0/16"));
        let back: Cluster = decode(&data).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_unknown_fields_preserved_for_current_version() {
        let doc = r#"
apiVersion: kops.k8s.io/v1alpha2
kind: Cluster
metadata:
  name: a.example.com
spec:
  cloudProvider: aws
  futureField:
    nested: true
"#;
        let c: Cluster = decode(doc.as_bytes()).unwrap();
        assert!(c.spec.unknown_fields.contains_key("futureField"));
        let again = String::from_utf8(encode(&c).unwrap()).unwrap();
        assert!(again.contains("futureField"));
    }

    #[test]
    fn test_legacy_version_drops_unknown_and_maps_master() {
        let doc = r#"
apiVersion: kops.k8s.io/v1alpha1
kind: InstanceGroup
metadata:
  name: master-us-test-1a
spec:
  role: Master
  minSize: 1
  maxSize: 1
  legacyOnly: x
"#;
        let ig: InstanceGroup = decode(doc.as_bytes()).unwrap();
        assert_eq!(ig.spec.role, InstanceGroupRole::ControlPlane);
        assert!(ig.spec.unknown_fields.is_empty());
        let out = String::from_utf8(encode(&ig).unwrap()).unwrap();
        assert!(out.contains("apiVersion: kops.k8s.io/v1alpha2"));
        assert!(out.contains("role: ControlPlane"));
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let doc = "apiVersion: kops.k8s.io/v9\nkind: Cluster\nmetadata:\n  name: x\n";
        let err = decode::<Cluster>(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedApiVersion { .. }));
    }

    #[test]
    fn test_wrong_kind() {
        let data = encode(&sample_cluster()).unwrap();
        let err = decode::<InstanceGroup>(&data).unwrap_err();
        assert!(matches!(err, CoreError::UnexpectedKind { .. }));
    }

    #[test]
    fn test_json_input_accepted() {
        let json = encode_json(&sample_cluster()).unwrap();
        let back: Cluster = decode(json.as_bytes()).unwrap();
        assert_eq!(back, sample_cluster());
    }

    #[test]
    fn test_decode_documents() {
        let ig = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        let mut data = encode(&sample_cluster()).unwrap();
        data.extend_from_slice(b"---\n");
        data.extend(encode(&ig).unwrap());
        let objects = decode_documents(&data).unwrap();
        assert_eq!(objects.len(), 2);
        assert!(matches!(objects[0], AnyObject::Cluster(_)));
        assert_eq!(objects[1], AnyObject::InstanceGroup(ig));
    }

    #[test]
    fn test_status_round_trip() {
        let status = ClusterStatus {
            last_applied_kubernetes_version: Some("1.31.4".to_string()),
            ..Default::default()
        };
        let back = decode_status(&encode_status(&status).unwrap()).unwrap();
        assert_eq!(back, status);
    }
}
