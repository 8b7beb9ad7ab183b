//! Model manifest parsing and validation.
//!
//! A manifest is a YAML file describing one servable model version: where
//! its weights live, the SHA-256 digest they must hash to, the license they
//! ship under, and any LoRA deltas that can be composed on top. Every
//! invariant is enforced at parse time — a manifest that points at a local
//! path, carries a malformed checksum, or omits a required field never
//! becomes a [`ModelManifest`] value.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// URI schemes a manifest is allowed to reference.
const ALLOWED_SCHEMES: &[&str] = &["https", "s3", "gs", "azure"];

/// License strings that are treated as "no license declared".
const FORBIDDEN_LICENSES: &[&str] = &["", "none", "unknown"];

/// Errors from manifest parsing and validation.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid sha256 checksum for {field}: expected 64 hex chars, got {value:?}")]
    InvalidChecksum { field: &'static str, value: String },
    #[error("local or schemeless URI rejected: {0}")]
    LocalUri(String),
    #[error("unsupported URI scheme '{scheme}' in {uri} (allowed: https, s3, gs, azure)")]
    UnsupportedScheme { scheme: String, uri: String },
    #[error("license '{0}' is not acceptable (must be declared and not none/unknown)")]
    ForbiddenLicense(String),
    #[error("unknown model kind: {0}")]
    UnknownKind(String),
    #[error("delta '{name}': {source}")]
    Delta {
        name: String,
        #[source]
        source: Box<ManifestError>,
    },
    #[error("failed to parse manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What kind of model a manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Diffusion,
    Text,
    Superres,
}

impl FromStr for ModelKind {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diffusion" => Ok(Self::Diffusion),
            "text" => Ok(Self::Text),
            "superres" | "super-resolution" => Ok(Self::Superres),
            other => Err(ManifestError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diffusion => write!(f, "diffusion"),
            Self::Text => write!(f, "text"),
            Self::Superres => write!(f, "superres"),
        }
    }
}

/// A LoRA weight delta declared by a manifest.
///
/// Carries the same URI and checksum invariants as the parent manifest,
/// enforced per-delta at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDelta {
    pub name: String,
    pub uri: String,
    pub sha256: String,
    pub size_bytes: Option<u64>,
}

/// A validated model manifest.
///
/// Construction goes through [`load_manifest`] / [`parse_manifest`] only, so
/// holding a `ModelManifest` implies every field passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelManifest {
    pub name: String,
    pub version: u32,
    pub kind: ModelKind,
    pub weights_uri: String,
    pub weights_sha256: String,
    pub license: String,
    pub deltas: Vec<ModelDelta>,
}

impl ModelManifest {
    /// Look up a delta by name.
    pub fn delta(&self, name: &str) -> Option<&ModelDelta> {
        self.deltas.iter().find(|d| d.name == name)
    }
}

// Raw deserialization targets. Every field is optional so that missing
// fields surface as `MissingField` rather than an opaque serde error.

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<u32>,
    #[serde(rename = "type", alias = "kind")]
    kind: Option<String>,
    weights_uri: Option<String>,
    weights_sha256: Option<String>,
    license: Option<String>,
    #[serde(default)]
    deltas: Vec<RawDelta>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    name: Option<String>,
    uri: Option<String>,
    sha256: Option<String>,
    size_bytes: Option<u64>,
}

/// Load and validate a manifest from a YAML file.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<ModelManifest, ManifestError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_manifest(&content)
}

/// Parse and validate a manifest from a YAML string.
pub fn parse_manifest(yaml: &str) -> Result<ModelManifest, ManifestError> {
    let raw: RawManifest = serde_yaml::from_str(yaml)?;

    let name = raw.name.ok_or(ManifestError::MissingField("name"))?;
    let version = raw.version.ok_or(ManifestError::MissingField("version"))?;
    let kind: ModelKind = raw
        .kind
        .ok_or(ManifestError::MissingField("type"))?
        .parse()?;
    let weights_uri = raw
        .weights_uri
        .ok_or(ManifestError::MissingField("weights_uri"))?;
    let weights_sha256 = raw
        .weights_sha256
        .ok_or(ManifestError::MissingField("weights_sha256"))?;
    let license = raw.license.ok_or(ManifestError::MissingField("license"))?;

    validate_uri(&weights_uri)?;
    let weights_sha256 = validate_checksum("weights_sha256", &weights_sha256)?;
    validate_license(&license)?;

    let mut deltas = Vec::with_capacity(raw.deltas.len());
    for raw_delta in raw.deltas {
        let delta_name = raw_delta
            .name
            .ok_or(ManifestError::MissingField("deltas[].name"))?;
        deltas.push(validate_delta(delta_name, raw_delta.uri, raw_delta.sha256, raw_delta.size_bytes)?);
    }

    Ok(ModelManifest {
        name,
        version,
        kind,
        weights_uri,
        weights_sha256,
        license,
        deltas,
    })
}

fn validate_delta(
    name: String,
    uri: Option<String>,
    sha256: Option<String>,
    size_bytes: Option<u64>,
) -> Result<ModelDelta, ManifestError> {
    let wrap = |source: ManifestError, name: &str| ManifestError::Delta {
        name: name.to_string(),
        source: Box::new(source),
    };

    let uri = uri.ok_or_else(|| wrap(ManifestError::MissingField("uri"), &name))?;
    let sha256 = sha256.ok_or_else(|| wrap(ManifestError::MissingField("sha256"), &name))?;

    validate_uri(&uri).map_err(|e| wrap(e, &name))?;
    let sha256 = validate_checksum("sha256", &sha256).map_err(|e| wrap(e, &name))?;

    Ok(ModelDelta {
        name,
        uri,
        sha256,
        size_bytes,
    })
}

/// Reject local-path, schemeless, and non-allowlisted URIs.
fn validate_uri(uri: &str) -> Result<(), ManifestError> {
    let parsed = Url::parse(uri).map_err(|_| ManifestError::LocalUri(uri.to_string()))?;
    let scheme = parsed.scheme();
    if scheme == "file" || scheme.is_empty() {
        return Err(ManifestError::LocalUri(uri.to_string()));
    }
    if !ALLOWED_SCHEMES.contains(&scheme) {
        return Err(ManifestError::UnsupportedScheme {
            scheme: scheme.to_string(),
            uri: uri.to_string(),
        });
    }
    Ok(())
}

/// Require exactly 64 hex characters; returns the lowercase form.
fn validate_checksum(field: &'static str, value: &str) -> Result<String, ManifestError> {
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ManifestError::InvalidChecksum {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_ascii_lowercase())
}

fn validate_license(license: &str) -> Result<(), ManifestError> {
    let normalized = license.trim().to_ascii_lowercase();
    if FORBIDDEN_LICENSES.contains(&normalized.as_str()) {
        return Err(ManifestError::ForbiddenLicense(license.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_SHA: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    fn good_yaml() -> String {
        format!(
            r#"
name: sdxl-base
version: 3
type: diffusion
weights_uri: https://cdn.gameforge.dev/models/sdxl-base-v3.safetensors
weights_sha256: {GOOD_SHA}
license: CreativeML-OpenRAIL-M
deltas:
  - name: anime-style
    uri: s3://gameforge-models/deltas/anime-style.safetensors
    sha256: {GOOD_SHA}
    size_bytes: 151000000
"#
        )
    }

    #[test]
    fn parses_valid_manifest() {
        let manifest = parse_manifest(&good_yaml()).unwrap();
        assert_eq!(manifest.name, "sdxl-base");
        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.kind, ModelKind::Diffusion);
        assert_eq!(manifest.deltas.len(), 1);
        assert_eq!(manifest.deltas[0].size_bytes, Some(151_000_000));
        assert!(manifest.delta("anime-style").is_some());
        assert!(manifest.delta("missing").is_none());
    }

    #[test]
    fn missing_license_is_named_in_error() {
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nweights_sha256: {GOOD_SHA}\n"
        );
        let err = parse_manifest(&yaml).unwrap_err();
        assert_eq!(err.to_string(), "missing required field: license");
    }

    #[test]
    fn missing_checksum_rejected() {
        let yaml = "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nlicense: MIT\n";
        let err = parse_manifest(yaml).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("weights_sha256")));
    }

    #[test]
    fn short_checksum_rejected() {
        // "deadbeef" is well-formed hex but not 64 chars.
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nweights_sha256: deadbeef\nlicense: MIT\n"
        );
        let err = parse_manifest(&yaml).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::InvalidChecksum {
                field: "weights_sha256",
                ..
            }
        ));
    }

    #[test]
    fn non_hex_checksum_rejected() {
        let bad = "z".repeat(64);
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nweights_sha256: {bad}\nlicense: MIT\n"
        );
        assert!(parse_manifest(&yaml).is_err());
    }

    #[test]
    fn checksum_is_lowercased() {
        let upper = GOOD_SHA.to_ascii_uppercase();
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nweights_sha256: {upper}\nlicense: MIT\n"
        );
        let manifest = parse_manifest(&yaml).unwrap();
        assert_eq!(manifest.weights_sha256, GOOD_SHA);
    }

    #[test]
    fn file_uri_rejected_before_any_download() {
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: file:///etc/passwd\nweights_sha256: {GOOD_SHA}\nlicense: MIT\n"
        );
        let err = parse_manifest(&yaml).unwrap_err();
        assert!(matches!(err, ManifestError::LocalUri(_)));
    }

    #[test]
    fn schemeless_uri_rejected() {
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: /var/models/w.safetensors\nweights_sha256: {GOOD_SHA}\nlicense: MIT\n"
        );
        assert!(matches!(
            parse_manifest(&yaml).unwrap_err(),
            ManifestError::LocalUri(_)
        ));
    }

    #[test]
    fn http_scheme_rejected() {
        let yaml = format!(
            "name: x\nversion: 1\ntype: text\nweights_uri: http://insecure/w\nweights_sha256: {GOOD_SHA}\nlicense: MIT\n"
        );
        assert!(matches!(
            parse_manifest(&yaml).unwrap_err(),
            ManifestError::UnsupportedScheme { .. }
        ));
    }

    #[test]
    fn s3_gs_azure_schemes_accepted() {
        for uri in [
            "s3://bucket/key",
            "gs://bucket/key",
            "azure://account/container/key",
        ] {
            let yaml = format!(
                "name: x\nversion: 1\ntype: text\nweights_uri: {uri}\nweights_sha256: {GOOD_SHA}\nlicense: MIT\n"
            );
            assert!(parse_manifest(&yaml).is_ok(), "uri {uri} should be allowed");
        }
    }

    #[test]
    fn placeholder_licenses_rejected() {
        for license in ["none", "NONE", "unknown", "Unknown", "  "] {
            let yaml = format!(
                "name: x\nversion: 1\ntype: text\nweights_uri: https://a/b\nweights_sha256: {GOOD_SHA}\nlicense: \"{license}\"\n"
            );
            assert!(
                matches!(
                    parse_manifest(&yaml).unwrap_err(),
                    ManifestError::ForbiddenLicense(_)
                ),
                "license {license:?} should be rejected"
            );
        }
    }

    #[test]
    fn delta_with_file_uri_rejected() {
        let yaml = format!(
            r#"
name: x
version: 1
type: diffusion
weights_uri: https://a/b
weights_sha256: {GOOD_SHA}
license: MIT
deltas:
  - name: sneaky
    uri: file:///tmp/delta.safetensors
    sha256: {GOOD_SHA}
"#
        );
        let err = parse_manifest(&yaml).unwrap_err();
        match err {
            ManifestError::Delta { name, source } => {
                assert_eq!(name, "sneaky");
                assert!(matches!(*source, ManifestError::LocalUri(_)));
            }
            other => panic!("expected Delta error, got {other}"),
        }
    }

    #[test]
    fn delta_missing_checksum_rejected() {
        let yaml = format!(
            r#"
name: x
version: 1
type: diffusion
weights_uri: https://a/b
weights_sha256: {GOOD_SHA}
license: MIT
deltas:
  - name: partial
    uri: https://a/delta
"#
        );
        assert!(matches!(
            parse_manifest(&yaml).unwrap_err(),
            ManifestError::Delta { .. }
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let yaml = format!(
            "name: x\nversion: 1\ntype: hologram\nweights_uri: https://a/b\nweights_sha256: {GOOD_SHA}\nlicense: MIT\n"
        );
        assert!(matches!(
            parse_manifest(&yaml).unwrap_err(),
            ManifestError::UnknownKind(_)
        ));
    }

    #[test]
    fn kind_round_trips_through_display() {
        for kind in [ModelKind::Diffusion, ModelKind::Text, ModelKind::Superres] {
            assert_eq!(kind.to_string().parse::<ModelKind>().unwrap(), kind);
        }
    }

    #[test]
    fn load_manifest_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.yaml");
        std::fs::write(&path, good_yaml()).unwrap();
        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.name, "sdxl-base");
    }

    #[test]
    fn load_manifest_missing_file_is_io_error() {
        let err = load_manifest("/nonexistent/model.yaml").unwrap_err();
        assert!(matches!(err, ManifestError::Io(_)));
    }
}
