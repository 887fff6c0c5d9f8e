//! Response holds the decision documents hooks write back after handling a review.

use std::{fmt::Write as _, io::Read, path::Path};

use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::*;

/// Artifact is implemented by every response document.
///
/// An artifact is a single JSON value, read from a file the hook wrote or from a stream.
pub trait Artifact: DeserializeOwned + Sized {
    /// From_slice decodes an artifact.
    fn from_slice(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }

    /// From_reader decodes an artifact from a stream.
    fn from_reader<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Self::from_slice(&buf)
    }

    /// From_file decodes the artifact at `p`.
    ///
    /// An empty file means the hook reported nothing and yields `None`.
    fn from_file<P: AsRef<Path>>(p: P) -> Result<Option<Self>> {
        let buf = std::fs::read(p)?;
        if buf.is_empty() {
            return Ok(None);
        }
        Self::from_slice(&buf).map(Some)
    }

    /// Dump returns a short description for logs.
    fn dump(&self) -> String;
}

/// Patch is the mutation a hook asks for.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Patch {
    /// A JSON Patch operation list.
    Ops(json_patch::Patch),
    /// A base64-encoded JSON Patch document.
    Encoded(ByteString),
}

impl Patch {
    /// Operations decodes the patch into operations.
    pub fn operations(&self) -> Result<json_patch::Patch> {
        match self {
            Patch::Ops(p) => Ok(p.clone()),
            Patch::Encoded(b) => Ok(serde_json::from_slice(&b.0)?),
        }
    }
}

/// MutatingResponse is written by a hook bound to `kubernetesMutating`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutatingResponse {
    /// Allowed admits the object.
    #[serde(default)]
    pub allowed: bool,
    /// Message is shown to the user when the request is denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Patch mutates the object. Only used when allowed.
    #[serde(default, alias = "patchOps", skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    /// Warnings are returned to the client verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl MutatingResponse {
    /// Allow builds an allowing response with no patch.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    /// Deny builds a denying response with the given message.
    pub fn deny<S: ToString>(msg: S) -> Self {
        Self {
            allowed: false,
            message: Some(msg.to_string()),
            ..Default::default()
        }
    }

    /// Patch_operations returns the decoded patch, or `None` if there is nothing to apply.
    pub fn patch_operations(&self) -> Result<Option<json_patch::Patch>> {
        match &self.patch {
            None => Ok(None),
            Some(p) => {
                let ops = p.operations()?;
                Ok(if ops.0.is_empty() { None } else { Some(ops) })
            }
        }
    }
}

impl Artifact for MutatingResponse {
    fn dump(&self) -> String {
        dump(
            "MutatingResponse",
            self.allowed,
            self.message.as_deref(),
            self.warnings.as_deref(),
        )
    }
}

/// ValidatingResponse is written by a hook bound to `kubernetesValidating`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatingResponse {
    /// Allowed admits the object.
    #[serde(default)]
    pub allowed: bool,
    /// Message is shown to the user when the request is denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Warnings are returned to the client verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl Artifact for ValidatingResponse {
    fn dump(&self) -> String {
        dump(
            "ValidatingResponse",
            self.allowed,
            self.message.as_deref(),
            self.warnings.as_deref(),
        )
    }
}

fn dump(kind: &str, allowed: bool, msg: Option<&str>, warnings: Option<&[String]>) -> String {
    let mut b = format!("{kind}(allowed={allowed}");
    if let Some(m) = msg.filter(|m| !m.is_empty()) {
        b.push(',');
        b.push_str(m);
    }
    for w in warnings.unwrap_or_default() {
        b.push(',');
        b.push_str(w);
    }
    b.push(')');
    b
}

/// ConversionResponse is written by a hook bound to `kubernetesCustomResourceConversion`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    /// FailedMessage reports the conversion as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_message: Option<String>,
    /// ConvertedObjects holds the objects at the new version, in request order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_objects: Option<Vec<Value>>,
}

impl Artifact for ConversionResponse {
    fn dump(&self) -> String {
        let mut b = String::from("ConversionResponse(");
        match &self.failed_message {
            Some(m) => {
                let _ = write!(b, "failed={m}");
            }
            None => {
                let n = self.converted_objects.as_ref().map_or(0, Vec::len);
                let _ = write!(b, "converted={n}");
            }
        }
        b.push(')');
        b
    }
}
