//! Object-key grammar.
//!
//! Simulation artifacts are named like
//! `x/universe.fo.eo.elemental.z1.c3d8@000000002.000000`: an arbitrary prefix
//! up to the literal `universe.fo.`, a dot-separated coordinate, and the
//! timestep after `@`. The decoded coordinate drives the placement of the
//! object inside the index tree.

use serde::{Deserialize, Serialize};

/// The semantic class of an object, i.e. the token following the simtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usage {
    Nodes,
    Elements,
    Nodal,
    Elemental,
    Skin,
    Elset,
    Nset,
    #[serde(rename = "elementactivationbitmap")]
    ElementActivationBitmap,
    #[serde(rename = "boundingbox")]
    BoundingBox,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Usage::Nodes => "nodes",
            Usage::Elements => "elements",
            Usage::Nodal => "nodal",
            Usage::Elemental => "elemental",
            Usage::Skin => "skin",
            Usage::Elset => "elset",
            Usage::Nset => "nset",
            Usage::ElementActivationBitmap => "elementactivationbitmap",
            Usage::BoundingBox => "boundingbox",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "nodes" => Usage::Nodes,
            "elements" => Usage::Elements,
            "nodal" => Usage::Nodal,
            "elemental" => Usage::Elemental,
            "skin" => Usage::Skin,
            "elset" => Usage::Elset,
            "nset" => Usage::Nset,
            "elementactivationbitmap" => Usage::ElementActivationBitmap,
            "boundingbox" => Usage::BoundingBox,
            _ => return None,
        })
    }

    /// Field usages carry a fieldname and place it (plus an optional
    /// elemtype) below the usage level of the tree.
    fn is_field(token: &str) -> bool {
        matches!(token, "nodal" | "elemental")
    }
}

/// A successfully decoded object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// Absent for legacy field keys that start directly with the usage token.
    pub simtype: Option<String>,
    pub usage: Usage,
    pub fieldname: Option<String>,
    pub elemtype: Option<String>,
    pub skintype: Option<String>,
    pub timestep: String,
}

impl DecodedKey {
    /// The tree levels below `namespace -> timestep` for this key, in order.
    pub fn tree_levels(&self) -> Vec<&str> {
        let mut levels = Vec::with_capacity(4);
        if let Some(simtype) = &self.simtype {
            levels.push(simtype.as_str());
        }
        levels.push(self.usage.as_str());
        match self.usage {
            Usage::Nodes | Usage::BoundingBox => {}
            Usage::Elements | Usage::ElementActivationBitmap => {
                levels.extend(self.elemtype.as_deref());
            }
            Usage::Skin => {
                levels.extend(self.skintype.as_deref());
                levels.extend(self.elemtype.as_deref());
            }
            Usage::Nodal | Usage::Nset | Usage::Elemental | Usage::Elset => {
                levels.extend(self.fieldname.as_deref());
                levels.extend(self.elemtype.as_deref());
            }
        }
        levels
    }
}

/// Decode `key` against the artifact naming grammar.
///
/// Returns `None` for keys that do not match; such keys never enter the
/// index. Field-mode keys come in two shapes: `simtype.usage.fieldname[.elemtype]`
/// and the legacy `usage.fieldname[.elemtype]` without a simtype token.
pub fn parse_object_key(key: &str) -> Option<DecodedKey> {
    let marker = key.find("universe.fo.")?;
    let rest = &key[marker + "universe.fo.".len()..];

    let mut halves = rest.split('@');
    let objects = halves.next()?;
    let timestep = halves.next()?;
    if halves.next().is_some() {
        return None;
    }

    let tokens: Vec<&str> = objects.split('.').collect();
    let timestep = timestep.to_string();

    if tokens.len() >= 2 && Usage::is_field(tokens[1]) {
        return Some(DecodedKey {
            simtype: Some(tokens[0].to_string()),
            usage: Usage::from_token(tokens[1])?,
            fieldname: Some(tokens.get(2)?.to_string()),
            elemtype: tokens.get(3).map(|t| t.to_string()),
            skintype: None,
            timestep,
        });
    }

    if Usage::is_field(tokens[0]) {
        return Some(DecodedKey {
            simtype: None,
            usage: Usage::from_token(tokens[0])?,
            fieldname: Some(tokens.get(1)?.to_string()),
            elemtype: tokens.get(2).map(|t| t.to_string()),
            skintype: None,
            timestep,
        });
    }

    if tokens.len() < 2 {
        return None;
    }
    let simtype = Some(tokens[0].to_string());
    let usage = Usage::from_token(tokens[1])?;

    let decoded = match usage {
        Usage::Nodes | Usage::BoundingBox => DecodedKey {
            simtype,
            usage,
            fieldname: None,
            elemtype: None,
            skintype: None,
            timestep,
        },
        Usage::Elements | Usage::ElementActivationBitmap => DecodedKey {
            simtype,
            usage,
            fieldname: None,
            elemtype: Some(tokens.get(2)?.to_string()),
            skintype: None,
            timestep,
        },
        Usage::Skin => DecodedKey {
            simtype,
            usage,
            fieldname: None,
            skintype: Some(tokens.get(2)?.to_string()),
            elemtype: Some(tokens.get(3)?.to_string()),
            timestep,
        },
        Usage::Elset => DecodedKey {
            simtype,
            usage,
            fieldname: Some(tokens.get(2)?.to_string()),
            elemtype: Some(tokens.get(3)?.to_string()),
            skintype: None,
            timestep,
        },
        Usage::Nset => DecodedKey {
            simtype,
            usage,
            fieldname: Some(tokens.get(2)?.to_string()),
            elemtype: tokens.get(3).map(|t| t.to_string()),
            skintype: None,
            timestep,
        },
        Usage::Nodal | Usage::Elemental => unreachable!("field usages handled above"),
    };

    Some(decoded)
}
