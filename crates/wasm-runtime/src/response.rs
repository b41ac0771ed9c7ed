//! Response envelopes returned by the VM.
//!
//! The module answers interpretation and generation calls with a JSON
//! envelope of the form `{"success": bool, "type": kind, "out": payload}`.
//! The shape of `out` depends on `type`, so the envelope is decoded into a
//! closed [`Payload`] enum rather than kept as loose JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker carried in `out` when the VM starts a generation.
pub const GEN_START: &str = "__generator__";

/// Marker carried in `out` when the VM has nothing left to generate.
pub const GEN_END: &str = "__stop_generation__";

/// Discriminant of a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Flag,
    Tex,
    String,
    Codeblock,
    Anchor,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Kind::Flag => "flag",
            Kind::Tex => "tex",
            Kind::String => "string",
            Kind::Codeblock => "codeblock",
            Kind::Anchor => "anchor",
        };
        f.write_str(name)
    }
}

/// Decoded `out` field, one case per [`Kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Flag(String),
    Tex(String),
    String(String),
    Codeblock { text: String },
    Anchor { title: String, tex: String, path: String },
}

impl Payload {
    /// The envelope kind this payload is carried under.
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Flag(_) => Kind::Flag,
            Payload::Tex(_) => Kind::Tex,
            Payload::String(_) => Kind::String,
            Payload::Codeblock { .. } => Kind::Codeblock,
            Payload::Anchor { .. } => Kind::Anchor,
        }
    }

    /// The payload text for the plain-string kinds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Flag(s) | Payload::Tex(s) | Payload::String(s) => Some(s),
            Payload::Codeblock { .. } | Payload::Anchor { .. } => None,
        }
    }

    fn from_json(kind: Kind, out: Value) -> std::result::Result<Self, String> {
        #[derive(Deserialize)]
        struct Text {
            text: String,
        }

        #[derive(Deserialize)]
        struct Anchor {
            title: String,
            tex: String,
            path: String,
        }

        let err = |e: serde_json::Error| format!("invalid `{}` payload: {}", kind, e);

        Ok(match kind {
            Kind::Flag => Payload::Flag(serde_json::from_value(out).map_err(err)?),
            Kind::Tex => Payload::Tex(serde_json::from_value(out).map_err(err)?),
            Kind::String => Payload::String(serde_json::from_value(out).map_err(err)?),
            Kind::Codeblock => {
                let Text { text } = serde_json::from_value(out).map_err(err)?;
                Payload::Codeblock { text }
            }
            Kind::Anchor => {
                let Anchor { title, tex, path } = serde_json::from_value(out).map_err(err)?;
                Payload::Anchor { title, tex, path }
            }
        })
    }

    fn to_json(&self) -> Value {
        match self {
            Payload::Flag(s) | Payload::Tex(s) | Payload::String(s) => Value::String(s.clone()),
            Payload::Codeblock { text } => serde_json::json!({ "text": text }),
            Payload::Anchor { title, tex, path } => {
                serde_json::json!({ "title": title, "tex": tex, "path": path })
            }
        }
    }
}

/// A decoded response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub struct Response {
    pub success: bool,
    pub out: Payload,
}

impl Response {
    /// Build a plain `string` response.
    pub fn string(success: bool, out: impl Into<String>) -> Self {
        Self {
            success,
            out: Payload::String(out.into()),
        }
    }

    /// Parse an envelope from its JSON text.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> Kind {
        self.out.kind()
    }

    /// Whether `out` is the start-of-generation marker.
    ///
    /// Sentinels are compared by value, whatever the envelope kind.
    pub fn is_generation_start(&self) -> bool {
        self.out.as_str() == Some(GEN_START)
    }

    /// Whether `out` is the end-of-generation marker.
    pub fn is_generation_end(&self) -> bool {
        self.out.as_str() == Some(GEN_END)
    }
}

/// Wire shape of an envelope before the payload is resolved.
#[derive(Serialize, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(rename = "type")]
    kind: Kind,
    out: Value,
}

impl TryFrom<Envelope> for Response {
    type Error = String;

    fn try_from(envelope: Envelope) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            success: envelope.success,
            out: Payload::from_json(envelope.kind, envelope.out)?,
        })
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Self {
            success: response.success,
            kind: response.kind(),
            out: response.out.to_json(),
        }
    }
}

/// Result of a typesetting call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typeset {
    pub success: bool,
    pub tex: String,
}
