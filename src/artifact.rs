use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use base64::Engine as _;
use flate2::read::GzDecoder;
use serde::Serialize;
use tar::Archive;

use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Content of a decoded node artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ArtifactValue {
    /// The archive held exactly one file.
    Single(String),
    Members(BTreeMap<String, String>),
}

impl ArtifactValue {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            ArtifactValue::Single(text) => Some(text),
            ArtifactValue::Members(_) => None,
        }
    }
}

/// Decode a base64 tarball (plain or gzip-compressed) as returned by the
/// engine's artifact endpoint.
pub fn decode_artifact(payload: &str) -> Result<ArtifactValue> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| Error::ArtifactDecode(format!("invalid base64 payload: {err}")))?;
    if bytes.is_empty() {
        return Err(Error::ArtifactDecode("empty artifact payload".to_string()));
    }

    let mut members = if bytes.starts_with(&GZIP_MAGIC) {
        read_members(GzDecoder::new(Cursor::new(bytes)))?
    } else {
        read_members(Cursor::new(bytes))?
    };

    if members.len() == 1 {
        let (_, content) = members.remove(0);
        return Ok(ArtifactValue::Single(content));
    }
    Ok(ArtifactValue::Members(members.into_iter().collect()))
}

fn read_members<R: Read>(reader: R) -> Result<Vec<(String, String)>> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| Error::ArtifactDecode(format!("invalid archive: {err}")))?;

    let mut members = Vec::new();
    for entry in entries {
        let mut entry =
            entry.map_err(|err| Error::ArtifactDecode(format!("invalid archive entry: {err}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|err| Error::ArtifactDecode(format!("invalid member path: {err}")))?
            .to_string_lossy()
            .into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(|err| {
            Error::ArtifactDecode(format!("member `{name}` is not valid UTF-8 text: {err}"))
        })?;
        members.push((name, content));
    }
    Ok(members)
}
