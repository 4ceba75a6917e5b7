//! Core domain types: rarities, wear buckets, item identifiers, float
//! ranges, and the collection/skin records the catalog persists.

use serde::{Deserialize, Serialize};

/// Closed, ordered rarity ladder. Input items for a trade-up must sit
/// exactly one rung below the chosen output rarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Consumer,
    Industrial,
    MilSpec,
    Restricted,
    Classified,
    Covert,
}

impl Rarity {
    pub const ALL: [Rarity; 6] = [
        Rarity::Consumer,
        Rarity::Industrial,
        Rarity::MilSpec,
        Rarity::Restricted,
        Rarity::Classified,
        Rarity::Covert,
    ];

    /// Vendor-specific search tag for this rarity.
    pub fn tag(self) -> &'static str {
        match self {
            Rarity::Consumer => "tag_Rarity_Common_Weapon",
            Rarity::Industrial => "tag_Rarity_Uncommon_Weapon",
            Rarity::MilSpec => "tag_Rarity_Rare_Weapon",
            Rarity::Restricted => "tag_Rarity_Mythical_Weapon",
            Rarity::Classified => "tag_Rarity_Legendary_Weapon",
            Rarity::Covert => "tag_Rarity_Ancient_Weapon",
        }
    }

    /// The rarity one rung below `self`, if any — the valid input rarity
    /// for a trade-up producing `self`.
    pub fn input_rarity(self) -> Option<Rarity> {
        let idx = Self::ALL.iter().position(|r| *r == self)?;
        idx.checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Stable snake_case key used in query strings and store columns.
    pub fn key(self) -> &'static str {
        match self {
            Rarity::Consumer => "consumer",
            Rarity::Industrial => "industrial",
            Rarity::MilSpec => "mil_spec",
            Rarity::Restricted => "restricted",
            Rarity::Classified => "classified",
            Rarity::Covert => "covert",
        }
    }

    pub fn from_key(key: &str) -> Option<Rarity> {
        Self::ALL.into_iter().find(|r| r.key() == key)
    }
}

/// Wear bucket. Each owns a half-open range on `[0, 1]`: lower bound
/// inclusive, upper bound exclusive, except the last bucket which is
/// inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exterior {
    FactoryNew,
    MinimalWear,
    FieldTested,
    WellWorn,
    BattleScarred,
}

impl Exterior {
    pub const ALL: [Exterior; 5] = [
        Exterior::FactoryNew,
        Exterior::MinimalWear,
        Exterior::FieldTested,
        Exterior::WellWorn,
        Exterior::BattleScarred,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Exterior::FactoryNew => "Factory New",
            Exterior::MinimalWear => "Minimal Wear",
            Exterior::FieldTested => "Field-Tested",
            Exterior::WellWorn => "Well-Worn",
            Exterior::BattleScarred => "Battle-Scarred",
        }
    }

    pub fn from_label(label: &str) -> Option<Exterior> {
        Self::ALL.into_iter().find(|e| e.label() == label)
    }

    /// `(min, max)` boundaries, lower inclusive / upper exclusive, except
    /// the last bucket which is inclusive on both ends.
    pub fn range(self) -> (f64, f64) {
        match self {
            Exterior::FactoryNew => (0.00, 0.07),
            Exterior::MinimalWear => (0.07, 0.15),
            Exterior::FieldTested => (0.15, 0.38),
            Exterior::WellWorn => (0.38, 0.45),
            Exterior::BattleScarred => (0.45, 1.00),
        }
    }

    /// Bucket a float into its exterior. Total over `[0, 1]`: a boundary
    /// value belongs to the lower-indexed bucket, and the last bucket
    /// absorbs its own upper bound.
    pub fn bucket(f: f64) -> Exterior {
        let f = f.clamp(0.0, 1.0);
        for e in Self::ALL {
            let (min, max) = e.range();
            if e == Exterior::BattleScarred {
                if f >= min && f <= max {
                    return e;
                }
            } else if f >= min && f < max {
                return e;
            }
        }
        Exterior::BattleScarred
    }
}

/// Build the canonical `"<baseName> (<exterior>)"` identifier.
pub fn to_market_hash_name(base_name: &str, exterior: Exterior) -> String {
    format!("{base_name} ({})", exterior.label())
}

/// Strip the trailing parenthesised exterior suffix, if any.
pub fn base_from_market_hash(name: &str) -> String {
    match name.rfind(" (") {
        Some(idx) if name.ends_with(')') => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

/// Parse the exterior suffix from a market hash name, defaulting to
/// `FieldTested` when absent, matching the default-wear convention for
/// items quoted without an explicit exterior.
pub fn parse_exterior(name: &str) -> Exterior {
    if let Some(idx) = name.rfind('(') {
        if let Some(end) = name.rfind(')') {
            if end > idx {
                let label = &name[idx + 1..end];
                if let Some(e) = Exterior::from_label(label) {
                    return e;
                }
            }
        }
    }
    Exterior::FieldTested
}

/// Per-base-name float range. Defaults to `(0, 1)` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub min_float: f64,
    pub max_float: f64,
}

impl Default for FloatRange {
    fn default() -> Self {
        Self {
            min_float: 0.0,
            max_float: 1.0,
        }
    }
}

impl FloatRange {
    pub fn new(min_float: f64, max_float: f64) -> Option<Self> {
        if (0.0..max_float).contains(&min_float) && max_float <= 1.0 {
            Some(Self {
                min_float,
                max_float,
            })
        } else {
            None
        }
    }

    pub fn width(&self) -> f64 {
        self.max_float - self.min_float
    }

    /// Widen this range by taking the min of mins and max of maxes —
    /// used when merging duplicate base names from the remote float
    /// catalog supplement.
    pub fn merge(&self, other: &FloatRange) -> FloatRange {
        FloatRange {
            min_float: self.min_float.min(other.min_float),
            max_float: self.max_float.max(other.max_float),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub display_name: String,
    pub steam_tag: String,
    pub normalized_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skin {
    pub market_hash_name: String,
    pub collection_id: String,
    pub base_name: String,
    pub exterior: Exterior,
    pub rarity: Rarity,
    pub is_stattrak: bool,
    pub is_souvenir: bool,
    pub sell_listings: u64,
    pub last_known_price: Option<f64>,
    pub float_min: Option<f64>,
    pub float_max: Option<f64>,
}

impl Skin {
    /// "Normal" means neither StatTrak nor Souvenir.
    pub fn is_normal(&self) -> bool {
        !self.is_stattrak && !self.is_souvenir
    }

    /// Parse `(baseName, exterior, isStatTrak, isSouvenir)` out of a raw
    /// market item name.
    pub fn parse_name(raw: &str) -> (String, Exterior, bool, bool) {
        let is_stattrak = raw.contains("StatTrak\u{2122}");
        let is_souvenir = raw.starts_with("Souvenir ");

        let mut stripped = raw.to_string();
        if is_stattrak {
            stripped = stripped.replace("StatTrak\u{2122} ", "");
        }
        if is_souvenir {
            stripped = stripped.trim_start_matches("Souvenir ").to_string();
        }

        let exterior = parse_exterior(&stripped);
        let base_name = base_from_market_hash(&stripped);

        (base_name, exterior, is_stattrak, is_souvenir)
    }
}

/// Parse a heterogeneous price string (`"$1.23"`, `"1,23 €"`,
/// `"1,234.56"`) into a USD decimal by detecting which separator is the
/// decimal point from the trailing group length. Returns `None` on
/// ambiguity.
pub fn parse_price(raw: &str) -> Option<f64> {
    let negative = raw.trim_start().starts_with('-');
    let filtered: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',').collect();
    if filtered.is_empty() {
        return None;
    }

    let last_dot = filtered.rfind('.');
    let last_comma = filtered.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot_idx), Some(comma_idx)) => {
            // Whichever separator appears last is the decimal point; the
            // other is a thousands grouping separator and is dropped.
            if dot_idx > comma_idx {
                filtered.replace(',', "")
            } else {
                filtered.replace('.', "").replacen(',', ".", 1)
            }
        }
        (Some(dot_idx), None) => normalize_single_separator(&filtered, dot_idx, '.')?,
        (None, Some(comma_idx)) => normalize_single_separator(&filtered, comma_idx, ',')?,
        (None, None) => filtered,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn normalize_single_separator(s: &str, last_idx: usize, sep: char) -> Option<String> {
    let occurrences = s.matches(sep).count();
    let trailing_len = s.len() - last_idx - 1;

    if occurrences > 1 {
        // Repeated separator can only be a thousands grouping.
        return Some(s.replace(sep, ""));
    }

    match trailing_len {
        1 | 2 => Some(if sep == ',' {
            s.replacen(',', ".", 1)
        } else {
            s.to_string()
        }),
        3 => Some(s.replace(sep, "")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exterior_bucketing_is_total_and_monotonic() {
        let samples = [0.0, 0.0699, 0.07, 0.1499, 0.15, 0.3799, 0.38, 0.4499, 0.45, 0.999, 1.0];
        let mut last_rank = 0usize;
        for f in samples {
            let e = Exterior::bucket(f);
            let rank = Exterior::ALL.iter().position(|x| *x == e).unwrap();
            assert!(rank >= last_rank);
            last_rank = rank;
        }
    }

    #[test]
    fn boundary_values_belong_to_lower_bucket() {
        assert_eq!(Exterior::bucket(0.07), Exterior::MinimalWear);
        assert_eq!(Exterior::bucket(0.15), Exterior::FieldTested);
        assert_eq!(Exterior::bucket(0.38), Exterior::WellWorn);
        assert_eq!(Exterior::bucket(0.45), Exterior::BattleScarred);
        assert_eq!(Exterior::bucket(1.0), Exterior::BattleScarred);
    }

    #[test]
    fn near_epsilon_boundaries_match_canonical() {
        assert_eq!(Exterior::bucket(0.069999999), Exterior::FactoryNew);
        assert_eq!(Exterior::bucket(0.149999999), Exterior::MinimalWear);
    }

    #[test]
    fn name_round_trip() {
        for base in ["AK-47 | Redline", "M4A4 | Howl"] {
            for e in Exterior::ALL {
                let name = to_market_hash_name(base, e);
                assert_eq!(base_from_market_hash(&name), base);
                assert_eq!(parse_exterior(&name), e);
            }
        }
    }

    #[test]
    fn default_exterior_is_field_tested() {
        assert_eq!(parse_exterior("AK-47 | Redline"), Exterior::FieldTested);
    }

    #[test]
    fn parse_name_flags() {
        let (base, ext, st, souv) =
            Skin::parse_name("StatTrak\u{2122} AK-47 | Redline (Field-Tested)");
        assert_eq!(base, "AK-47 | Redline");
        assert_eq!(ext, Exterior::FieldTested);
        assert!(st);
        assert!(!souv);
    }

    #[test]
    fn price_parsing_dollar() {
        assert_eq!(parse_price("$1.23"), Some(1.23));
    }

    #[test]
    fn price_parsing_euro_comma_decimal() {
        assert_eq!(parse_price("1,23 \u{20ac}"), Some(1.23));
    }

    #[test]
    fn price_parsing_thousands_and_decimal() {
        assert_eq!(parse_price("1,234.56"), Some(1234.56));
    }

    #[test]
    fn price_parsing_ambiguous_returns_none() {
        assert_eq!(parse_price("1,2345"), None);
    }

    #[test]
    fn input_rarity_one_below() {
        assert_eq!(Rarity::Covert.input_rarity(), Some(Rarity::Classified));
        assert_eq!(Rarity::Consumer.input_rarity(), None);
    }
}
