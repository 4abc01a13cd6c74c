//! Deterministic ranking of GGUF weight-file variants.
//!
//! Candidates are ordered by preference tier, then label, then path. Balanced
//! mid-size quantizations come first, higher-fidelity formats next, lower
//! fidelity after that, and the exotic importance-matrix formats last.
//! Files that are not a primary model file always sort after every primary file.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Tier for labels that are not in the table, even after normalization.
pub const UNKNOWN_TIER: u8 = 98;
/// Tier for shards, projectors and other auxiliary files.
pub const AUXILIARY_TIER: u8 = 99;

const PREFERENCE: &[(&str, u8)] = &[
    ("Q4_K_M", 0),
    ("Q4_K_S", 1),
    ("Q5_K_M", 1),
    ("Q5_K_S", 2),
    ("Q4_0", 2),
    ("Q5_0", 3),
    ("Q6_K", 3),
    ("Q8_0", 4),
    ("F16", 5),
    ("BF16", 5),
    ("F32", 6),
    ("Q3_K_L", 7),
    ("Q3_K_M", 7),
    ("Q3_K_S", 8),
    ("Q2_K", 8),
    ("IQ4_XS", 9),
    ("IQ4_NL", 9),
    ("IQ3_M", 10),
    ("IQ3_S", 10),
    ("IQ3_XS", 10),
    ("IQ3_XXS", 10),
    ("IQ2_M", 11),
    ("IQ2_S", 11),
    ("IQ2_XS", 11),
    ("IQ2_XXS", 11),
    ("IQ1_M", 11),
    ("IQ1_S", 11),
];

// Suffixes stripped, longest first, when a label is not found as written.
const STRIPPABLE_SUFFIXES: &[&str] = &[".GGUF", "_IMATRIX", "-IMATRIX", "_IMAT", "-IMAT", "_XL", "_L"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GgufCandidate {
    pub path: PathBuf,
    pub quantization_label: String,
    pub is_main_model_file: bool,
    pub size_bytes: u64,
}

impl GgufCandidate {
    pub fn new(
        path: impl Into<PathBuf>,
        quantization_label: impl Into<String>,
        is_main_model_file: bool,
    ) -> Self {
        Self {
            path: path.into(),
            quantization_label: quantization_label.into(),
            is_main_model_file,
            size_bytes: 0,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Build a candidate from a file name such as `llama-3.2-1b.Q4_K_M.gguf`.
    pub fn from_path(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let label = parse_quantization_label(&path).unwrap_or_default();
        let is_main = is_main_model_file(&path);
        Self {
            path,
            quantization_label: label,
            is_main_model_file: is_main,
            size_bytes,
        }
    }

    pub fn tier(&self) -> u8 {
        if !self.is_main_model_file {
            return AUXILIARY_TIER;
        }
        quantization_tier(&self.quantization_label)
    }
}

/// Tier for a label; unknown labels are normalized before falling back to [`UNKNOWN_TIER`].
pub fn quantization_tier(label: &str) -> u8 {
    let upper = label.trim().to_ascii_uppercase();
    if let Some(tier) = lookup(&upper) {
        return tier;
    }

    let mut normalized = upper.as_str();
    loop {
        let Some(stripped) = STRIPPABLE_SUFFIXES
            .iter()
            .find_map(|suffix| normalized.strip_suffix(suffix))
        else {
            break;
        };
        normalized = stripped;
        if let Some(tier) = lookup(normalized) {
            return tier;
        }
    }

    UNKNOWN_TIER
}

fn lookup(label: &str) -> Option<u8> {
    PREFERENCE
        .iter()
        .find(|(known, _)| *known == label)
        .map(|(_, tier)| *tier)
}

fn compare(a: &GgufCandidate, b: &GgufCandidate) -> Ordering {
    a.tier()
        .cmp(&b.tier())
        .then_with(|| a.quantization_label.cmp(&b.quantization_label))
        .then_with(|| a.path.cmp(&b.path))
}

/// Candidates ordered best first. Input is not modified.
pub fn rank(candidates: &[GgufCandidate]) -> Vec<GgufCandidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(compare);
    ranked
}

pub fn best(candidates: &[GgufCandidate]) -> Option<GgufCandidate> {
    candidates.iter().min_by(|a, b| compare(a, b)).cloned()
}

/// Quantization label embedded in a GGUF file name, upper-cased.
pub fn parse_quantization_label(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let stem = strip_shard_suffix(stem);
    let upper = stem.to_ascii_uppercase();

    let mut found: Option<(usize, &str)> = None;
    for (label, _) in PREFERENCE {
        if let Some(pos) = upper.rfind(label) {
            let before_ok = pos == 0
                || matches!(upper.as_bytes()[pos - 1], b'.' | b'-' | b'_');
            let end = pos + label.len();
            let after_ok = end == upper.len()
                || matches!(upper.as_bytes()[end], b'.' | b'-' | b'_');
            if !(before_ok && after_ok) {
                continue;
            }
            // Prefer the longest label at the right-most position (IQ3_XXS over IQ3_XS).
            let better = match found {
                None => true,
                Some((best_pos, best_label)) => {
                    pos > best_pos || (pos == best_pos && label.len() > best_label.len())
                }
            };
            if better {
                found = Some((pos, label));
            }
        }
    }

    if let Some((pos, _)) = found {
        // Keep trailing variant markers (e.g. `_L`, `-IMAT`) so the ranker can normalize them.
        let tail = &upper[pos..];
        let label = tail
            .split('.')
            .next()
            .unwrap_or(tail)
            .to_string();
        return Some(label);
    }

    upper
        .rsplit(['.', '-'])
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn strip_shard_suffix(stem: &str) -> &str {
    shard_position(stem).map(|pos| &stem[..pos]).unwrap_or(stem)
}

// Byte offset of a `-00001-of-00003` suffix, if present.
fn shard_position(stem: &str) -> Option<usize> {
    let pos = stem.rfind("-of-")?;
    let total = &stem[pos + 4..];
    let head = &stem[..pos];
    let dash = head.rfind('-')?;
    let index = &head[dash + 1..];
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    (digits(index) && digits(total)).then_some(dash)
}

/// Whether a file is a standalone primary model file.
///
/// Shards, projector weights and other auxiliary files are not.
pub fn is_main_model_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    if !lower.ends_with(".gguf") {
        return false;
    }
    if lower.contains("mmproj") || lower.contains("projector") {
        return false;
    }
    // Importance-matrix data, as opposed to weights quantized with one.
    if lower.contains("imatrix") && !names_known_quantization(path) {
        return false;
    }
    let stem = &name[..name.len() - ".gguf".len()];
    match shard_position(stem) {
        None => true,
        Some(_) => shard_total(stem) == Some(1),
    }
}

fn names_known_quantization(path: &Path) -> bool {
    parse_quantization_label(path)
        .map(|label| quantization_tier(&label) != UNKNOWN_TIER)
        .unwrap_or(false)
}

fn shard_total(stem: &str) -> Option<u32> {
    let pos = stem.rfind("-of-")?;
    stem[pos + 4..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aux_shard_sorts_after_all_main_files() {
        let input = vec![
            GgufCandidate::new("m.Q8_0.gguf", "Q8_0", true),
            GgufCandidate::new("m.Q4_K_M.gguf", "Q4_K_M", true),
            GgufCandidate::new("m.Q4_K_M-00001-of-00002.gguf", "Q4_K_M", false),
        ];
        let ranked = rank(&input);
        let summary: Vec<(&str, bool)> = ranked
            .iter()
            .map(|c| (c.quantization_label.as_str(), c.is_main_model_file))
            .collect();
        assert_eq!(
            summary,
            vec![("Q4_K_M", true), ("Q8_0", true), ("Q4_K_M", false)]
        );
        assert_eq!(input[0].quantization_label, "Q8_0");
    }

    #[test]
    fn ordering_is_independent_of_input_order() {
        let mut input = vec![
            GgufCandidate::new("b/m.IQ2_XS.gguf", "IQ2_XS", true),
            GgufCandidate::new("a/m.F16.gguf", "F16", true),
            GgufCandidate::new("a/m.Q5_K_M.gguf", "Q5_K_M", true),
            GgufCandidate::new("a/m.Q4_K_S.gguf", "Q4_K_S", true),
            GgufCandidate::new("a/m.weird.gguf", "WEIRD", true),
            GgufCandidate::new("a/mmproj.F16.gguf", "F16", false),
            GgufCandidate::new("a/m.Q2_K.gguf", "Q2_K", true),
        ];
        let forward = rank(&input);
        input.reverse();
        assert_eq!(rank(&input), forward);

        let labels: Vec<&str> = forward
            .iter()
            .map(|c| c.quantization_label.as_str())
            .collect();
        assert_eq!(
            labels,
            vec!["Q4_K_S", "Q5_K_M", "F16", "Q2_K", "IQ2_XS", "WEIRD", "F16"]
        );
    }

    #[test]
    fn full_precision_outranks_low_bit_quantizations() {
        assert!(quantization_tier("Q8_0") < quantization_tier("F16"));
        assert!(quantization_tier("F16") < quantization_tier("F32"));
        assert!(quantization_tier("F32") < quantization_tier("Q3_K_M"));
        assert!(quantization_tier("Q3_K_M") < quantization_tier("IQ4_XS"));
        assert!(quantization_tier("BF16") < quantization_tier("Q2_K"));
        assert!(quantization_tier("Q2_K") < quantization_tier("IQ1_S"));
    }

    #[test]
    fn path_breaks_ties() {
        let input = vec![
            GgufCandidate::new("z/model.Q4_K_M.gguf", "Q4_K_M", true),
            GgufCandidate::new("a/model.Q4_K_M.gguf", "Q4_K_M", true),
        ];
        assert_eq!(
            best(&input).unwrap().path,
            PathBuf::from("a/model.Q4_K_M.gguf")
        );
    }

    #[test]
    fn empty_input_has_no_best() {
        assert!(best(&[]).is_none());
        assert!(rank(&[]).is_empty());
    }

    #[test]
    fn unknown_labels_are_normalized() {
        assert_eq!(quantization_tier("q4_k_m"), 0);
        assert_eq!(quantization_tier("Q3_K_XL"), UNKNOWN_TIER);
        assert_eq!(quantization_tier("Q4_K_M-IMAT"), 0);
        assert_eq!(quantization_tier("Q6_K_L"), 3);
        assert_eq!(quantization_tier("Q8_0.gguf"), 4);
        assert_eq!(quantization_tier("mystery"), UNKNOWN_TIER);
    }

    #[test]
    fn parses_labels_from_file_names() {
        let parse = |name: &str| parse_quantization_label(Path::new(name)).unwrap();
        assert_eq!(parse("Llama-3.2-1B-Instruct.Q4_K_M.gguf"), "Q4_K_M");
        assert_eq!(parse("qwen2.5-0.5b-instruct-q5_k_s.gguf"), "Q5_K_S");
        assert_eq!(parse("phi-IQ3_XXS.gguf"), "IQ3_XXS");
        assert_eq!(parse("model-Q8_0-00001-of-00002.gguf"), "Q8_0");
        assert_eq!(parse("gemma-2b-Q6_K_L.gguf"), "Q6_K_L");
    }

    #[test]
    fn detects_auxiliary_files() {
        assert!(is_main_model_file(Path::new("m.Q4_K_M.gguf")));
        assert!(!is_main_model_file(Path::new("m.Q4_K_M-00001-of-00002.gguf")));
        assert!(!is_main_model_file(Path::new("mmproj-model-f16.gguf")));
        assert!(!is_main_model_file(Path::new("README.md")));

        let candidate = GgufCandidate::from_path("m-00002-of-00003.gguf", 10);
        assert_eq!(candidate.tier(), AUXILIARY_TIER);
    }

    #[test]
    fn single_part_split_is_a_main_file() {
        assert!(is_main_model_file(Path::new("m.Q4_K_M-00001-of-00001.gguf")));
        let candidate = GgufCandidate::from_path("m.Q4_K_M-00001-of-00001.gguf", 10);
        assert_eq!(candidate.quantization_label, "Q4_K_M");
        assert_eq!(candidate.tier(), 0);
    }

    #[test]
    fn imatrix_weights_rank_by_base_label_but_imatrix_data_does_not() {
        let weights = GgufCandidate::from_path("llama-Q4_K_M-IMATRIX.gguf", 10);
        assert!(weights.is_main_model_file);
        assert_eq!(weights.quantization_label, "Q4_K_M-IMATRIX");
        assert_eq!(weights.tier(), 0);

        let underscored = GgufCandidate::from_path("llama.Q5_K_M_imatrix.gguf", 10);
        assert_eq!(underscored.tier(), 1);

        assert!(!is_main_model_file(Path::new("llama.imatrix.gguf")));
        assert!(!is_main_model_file(Path::new("imatrix.gguf")));
    }
}
