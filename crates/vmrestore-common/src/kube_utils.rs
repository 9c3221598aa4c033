//! Shared Kubernetes helpers
//!
//! External resources this controller reads but does not define (KubeVirt
//! machines, CDI DataVolumes, CSI VolumeSnapshots) are accessed through
//! `DynamicObject` and converted to typed views. [`HasApiResource`] ties each
//! typed view to its apiVersion/kind so the `ApiResource` is built the same
//! way everywhere.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;

/// Trait for types that have a known API group, version, and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for DataVolume {
///     const API_VERSION: &'static str = "cdi.kubevirt.io/v1beta1";
///     const KIND: &'static str = "DataVolume";
/// }
///
/// let ar = DataVolume::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "kubevirt.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VirtualMachine")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion string and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split "group/version" into its parts; core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lower-case plural for a kind
///
/// Covers the kinds this controller touches; everything else gets the
/// simple English rules the API server uses for generated plurals.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Convert a `DynamicObject` into a typed view
pub fn from_dynamic<T>(obj: DynamicObject) -> Result<T, Error>
where
    T: DeserializeOwned + HasApiResource,
{
    let value = serde_json::to_value(&obj)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Convert a typed view into a `DynamicObject` with apiVersion/kind filled in
pub fn to_dynamic<T>(obj: &T) -> Result<DynamicObject, Error>
where
    T: Serialize + HasApiResource,
{
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), T::API_VERSION.into());
        map.insert("kind".to_string(), T::KIND.into());
    }
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Map a 404 from a GET into `Ok(None)`
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The controller owner reference on `owners`, if any
pub fn controller_owner(owners: Option<&[OwnerReference]>) -> Option<&OwnerReference> {
    owners?.iter().find(|o| o.controller == Some(true))
}
