//! # Variable Catalog
//!
//! Parses the PSX `Variables.txt` definition format and answers questions
//! about a keyword's network mode, valid range, and whether a bare word is
//! part of the protocol at all.
//!
//! ## Format
//!
//! Semicolon-separated `key=value` fields on each line. A line that starts
//! with `Q` begins a new keyword definition (`Qi224="AtcPhase"`); the fields
//! that follow on the same line (`Mode=`, `Min=`, `Max=`) belong to it.
//! Blank lines and `[Section]` headers are ignored.

use std::collections::HashMap;
use std::path::Path;

use crate::error::CatalogError;

/// Official home of the PSX network variable definition file, used as a
/// one-time fallback when the configured local copy is missing.
const AEROWINX_VARIABLES_URL: &str = "https://aerowinx.com/assets/networkers/Variables.txt";

pub const NETWORK_MODES: &[&str] = &[
    "ECON", "DELTA", "START", "XECON", "DEMAND", "XDELTA", "MCPMOM", "BIGMOM", "GUAMOM4",
    "GUAMOM2", "CDUKEYB", "RCP", "ACP", "MIXED",
];

/// Keywords whose network mode in the catalog file undersells their real
/// behavior. Aerowinx documents Qs493/Qi208 as also acting like ECON, and
/// the NOLONG keywords aren't a network mode PSX defines at all but we
/// track them the same way.
fn additional_modes(keyword: &str) -> &'static [&'static str] {
    match keyword {
        "Qs493" | "Qi208" => &["ECON"],
        "Qs375" | "Qs376" | "Qs377" | "Qs407" | "Qs408" | "Qs409" | "Qs410" | "Qs411"
        | "Qs412" => &["NOLONG"],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct VariableDef {
    pub name: String,
    pub mode: String,
    pub min: i64,
    pub max: i64,
    pub additional_modes: Vec<&'static str>,
}

/// A parsed PSX network variable definition table.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    variables: HashMap<String, VariableDef>,
}

impl Catalog {
    pub fn parse(data: &str) -> Result<Self, CatalogError> {
        struct Partial {
            name: Option<String>,
            mode: Option<String>,
            min: Option<i64>,
            max: Option<i64>,
        }

        let mut partials: HashMap<String, Partial> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut current: Option<String> = None;

        for raw_line in data.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            for elem in line.split(';') {
                let elem = elem.trim();
                if elem.is_empty() {
                    continue;
                }
                let (key, value) = elem
                    .split_once('=')
                    .ok_or_else(|| CatalogError::InvalidLine(line.to_string()))?;

                if key.starts_with('Q') {
                    let value = value.replace('"', "");
                    if partials.contains_key(key) {
                        return Err(CatalogError::DuplicateKeyword(key.to_string()));
                    }
                    partials.insert(
                        key.to_string(),
                        Partial {
                            name: Some(value),
                            mode: None,
                            min: None,
                            max: None,
                        },
                    );
                    order.push(key.to_string());
                    current = Some(key.to_string());
                } else {
                    let cur = current
                        .as_ref()
                        .ok_or_else(|| CatalogError::InvalidLine(line.to_string()))?;
                    let entry = partials
                        .get_mut(cur)
                        .ok_or_else(|| CatalogError::InvalidLine(line.to_string()))?;
                    match key {
                        "Mode" => {
                            if !NETWORK_MODES.contains(&value) {
                                return Err(CatalogError::UnknownMode {
                                    keyword: cur.clone(),
                                    mode: value.to_string(),
                                });
                            }
                            entry.mode = Some(value.to_string());
                        }
                        "Min" => {
                            entry.min = Some(
                                value
                                    .parse()
                                    .map_err(|_| CatalogError::InvalidInteger(line.to_string()))?,
                            );
                        }
                        "Max" => {
                            entry.max = Some(
                                value
                                    .parse()
                                    .map_err(|_| CatalogError::InvalidInteger(line.to_string()))?,
                            );
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut variables = HashMap::with_capacity(partials.len());
        for key in order {
            let partial = partials.remove(&key).expect("key was just inserted");
            let (Some(name), Some(mode), Some(min), Some(max)) =
                (partial.name, partial.mode, partial.min, partial.max)
            else {
                return Err(CatalogError::IncompleteDefinition(key));
            };
            variables.insert(
                key.clone(),
                VariableDef {
                    name,
                    mode,
                    min,
                    max,
                    additional_modes: additional_modes(&key).to_vec(),
                },
            );
        }

        Ok(Self { variables })
    }

    pub fn get(&self, keyword: &str) -> Option<&VariableDef> {
        self.variables.get(keyword)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Keywords that carry this network mode, either as their primary mode
    /// or via the small set of Aerowinx-documented exceptions.
    pub fn keywords_with_mode(&self, mode: &str) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(_, def)| def.mode == mode || def.additional_modes.contains(&mode))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Bare reserved words that are part of the protocol but not carried
    /// in the `Variables.txt` table at all.
    const RESERVED_BARE_WORDS: &'static [&'static str] = &[
        "exit",
        "cduC",
        "cduL",
        "cduR",
        "bang",
        "name",
        "id",
        "start",
        "lexicon",
        "again",
        "gid",
        "version",
        "layout",
        "metar",
        "demand",
        "load1",
        "load2",
        "load3",
        "keepalive",
        "clientName",
        "pleaseBeSoKindAndQuit",
        "nolong",
    ];

    /// Returns true if `keyword` is a normal PSX network keyword: either a
    /// `Q[shid]`/`L[sih]`-prefixed variable, or one of the small set of
    /// reserved bare protocol words. Implemented without a regexp since this
    /// runs on every received message.
    pub fn is_psx_keyword(&self, keyword: &str) -> bool {
        let mut chars = keyword.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        let Some(second) = chars.next() else {
            return Self::RESERVED_BARE_WORDS.contains(&keyword);
        };
        match first {
            'Q' => matches!(second, 'h' | 's' | 'd' | 'i'),
            'L' => matches!(second, 's' | 'i' | 'h'),
            _ => Self::RESERVED_BARE_WORDS.contains(&keyword),
        }
    }

    /// Sort PSX keywords numerically in the order PSX outputs them
    /// (`Qs1`, `Qs42`, `Qs100`, not lexical `Qs1`, `Qs100`, `Qs42`).
    pub fn sort_psx_keywords(&self, input: &mut [String]) {
        input.sort_by_key(|key| alphanum_key(key));
    }
}

fn alphanum_key(key: &str) -> Vec<AlphanumPart> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;
    for c in key.chars() {
        if c.is_ascii_digit() {
            if !in_digits && !current.is_empty() {
                parts.push(AlphanumPart::Text(current.to_lowercase()));
                current = String::new();
            }
            in_digits = true;
            current.push(c);
        } else {
            if in_digits && !current.is_empty() {
                parts.push(AlphanumPart::Number(current.parse().unwrap_or(0)));
                current = String::new();
            }
            in_digits = false;
            current.push(c);
        }
    }
    if !current.is_empty() {
        if in_digits {
            parts.push(AlphanumPart::Number(current.parse().unwrap_or(0)));
        } else {
            parts.push(AlphanumPart::Text(current.to_lowercase()));
        }
    }
    parts
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum AlphanumPart {
    Number(u64),
    Text(String),
}

/// Loads the catalog from `path`; if it's missing, fetches it once from
/// Aerowinx, writes it to `path` for next time, and parses the response.
/// Any failure past that point (fetch or parse) is fatal, matching
/// `variables.py`'s `VariablesException` on a failed download.
pub fn load_or_fetch(path: &Path) -> anyhow::Result<Catalog> {
    if path.exists() {
        let data = std::fs::read_to_string(path)?;
        return Ok(Catalog::parse(&data)?);
    }

    tracing::warn!(path = %path.display(), "variable catalog not found, trying Aerowinx");
    let data = reqwest::blocking::get(AEROWINX_VARIABLES_URL)
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.text())
        .map_err(|e| anyhow::anyhow!("failed to download variable catalog from Aerowinx: {e}"))?;

    if let Err(e) = std::fs::write(path, &data) {
        tracing::warn!(error = %e, path = %path.display(), "failed to cache downloaded catalog to disk");
    }
    tracing::info!("downloaded variable catalog from Aerowinx");
    Ok(Catalog::parse(&data)?)
}
