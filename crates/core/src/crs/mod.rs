//! Coordinate Reference System identity
//!
//! phytostat never reprojects: a `CRS` is only compared, so that features and
//! raster sources that disagree are rejected before any pixel is read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A declared coordinate reference system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CRS {
    /// EPSG registry code
    Epsg(u32),
    /// OGC WKT (version 1 or 2)
    Wkt(String),
    /// PROJ string (`+proj=...`)
    Proj(String),
}

impl CRS {
    pub fn from_epsg(code: u32) -> Self {
        CRS::Epsg(code)
    }

    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        CRS::Wkt(wkt.into())
    }

    pub fn from_proj(proj: impl Into<String>) -> Self {
        CRS::Proj(proj.into())
    }

    /// Geographic WGS 84 (EPSG:4326)
    pub fn wgs84() -> Self {
        CRS::Epsg(4326)
    }

    /// EPSG code, also when a WKT definition carries one in its outermost
    /// `AUTHORITY` / `ID` clause
    pub fn epsg(&self) -> Option<u32> {
        match self {
            CRS::Epsg(code) => Some(*code),
            CRS::Wkt(wkt) => wkt_authority_code(wkt),
            CRS::Proj(_) => None,
        }
    }

    pub fn wkt(&self) -> Option<&str> {
        match self {
            CRS::Wkt(wkt) => Some(wkt),
            _ => None,
        }
    }

    pub fn proj(&self) -> Option<&str> {
        match self {
            CRS::Proj(proj) => Some(proj),
            _ => None,
        }
    }

    /// Whether two definitions name the same system.
    ///
    /// EPSG codes are compared when both sides have one; otherwise two
    /// definitions of the same kind are compared with whitespace collapsed.
    pub fn is_equivalent(&self, other: &CRS) -> bool {
        if let (Some(a), Some(b)) = (self.epsg(), other.epsg()) {
            return a == b;
        }
        match (self, other) {
            (CRS::Wkt(a), CRS::Wkt(b)) | (CRS::Proj(a), CRS::Proj(b)) => {
                collapse_whitespace(a) == collapse_whitespace(b)
            }
            _ => false,
        }
    }

    /// Short human-readable identifier, used in error messages
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg() {
            return format!("EPSG:{code}");
        }
        match self {
            CRS::Proj(proj) => proj.clone(),
            CRS::Wkt(wkt) => {
                let head: String = wkt.chars().take(50).collect();
                format!("WKT:{head}")
            }
            CRS::Epsg(code) => format!("EPSG:{code}"),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Code of the last `AUTHORITY["EPSG","n"]` (WKT1) or `ID["EPSG",n]` (WKT2)
fn wkt_authority_code(wkt: &str) -> Option<u32> {
    let upper = wkt.to_ascii_uppercase();
    let start = ["AUTHORITY[\"EPSG\",", "ID[\"EPSG\","]
        .iter()
        .filter_map(|tag| upper.rfind(tag).map(|i| i + tag.len()))
        .max()?;
    let digits: String = upper[start..]
        .trim_start_matches([' ', '"'])
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

impl FromStr for CRS {
    type Err = Error;

    /// Parse `EPSG:32619`, a bare code, an OGC URN
    /// (`urn:ogc:def:crs:EPSG::32619`, `...:OGC:1.3:CRS84`), a PROJ string or
    /// WKT.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(Error::InvalidParameter {
                name: "crs",
                value: s.to_string(),
                reason: "empty CRS definition".into(),
            });
        }

        let lower = text.to_ascii_lowercase();
        if lower.ends_with("crs84") {
            return Ok(CRS::wgs84());
        }
        let code = if let Some(rest) = lower.strip_prefix("epsg:") {
            rest
        } else if lower.starts_with("urn:ogc:def:crs:epsg:") {
            lower.rsplit(':').next().unwrap_or_default()
        } else {
            lower.as_str()
        };
        if let Ok(code) = code.parse::<u32>() {
            return Ok(CRS::Epsg(code));
        }

        if text.starts_with('+') {
            return Ok(CRS::Proj(text.to_string()));
        }
        if text.contains('[') {
            return Ok(CRS::Wkt(text.to_string()));
        }
        Err(Error::InvalidParameter {
            name: "crs",
            value: s.to_string(),
            reason: "expected an EPSG code, OGC URN, PROJ string or WKT".into(),
        })
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}
