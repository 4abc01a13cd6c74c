//! Native library path resolution.

use std::path::PathBuf;

use tracing::{debug, warn};

use super::detect::{CpuTier, Platform, PlatformProbe};
use super::BackendKind;
use crate::config::BackendSettings;

/// GPU variant directory under `native/`.
pub const GPU_VARIANT_DIR: &str = "cuda12";

/// File name of the primary native library on `platform`.
pub fn library_file_name(platform: &Platform, stem: &str) -> String {
    match platform.os.as_str() {
        "windows" => format!("{stem}.dll"),
        "macos" => format!("lib{stem}.dylib"),
        _ => format!("lib{stem}.so"),
    }
}

/// Best existing library path for `kind`, or the conventional default when none exists.
///
/// Search order: explicit configured path, flat container directory, then the
/// layered `<runtimes>/<os>-<arch>/native/<variant>/` tree. For CPU the variant
/// walks instruction-set tiers from the best the host supports downwards.
pub fn resolve_library_path(
    probe: &dyn PlatformProbe,
    kind: BackendKind,
    settings: &BackendSettings,
) -> PathBuf {
    let platform = probe.platform();
    let file_name = library_file_name(&platform, "llama");

    if let Some(raw) = settings.library_path.as_deref() {
        let expanded = PathBuf::from(expand_env_vars(raw, |key| probe.env_var(key)));
        if probe.path_exists(&expanded) {
            return expanded;
        }
        warn!(
            "Configured library path {} does not exist; searching defaults",
            expanded.display()
        );
    }

    let flat = settings.container_lib_dir.join(&file_name);
    if probe.path_exists(&flat) {
        return flat;
    }

    let native_root = settings
        .runtimes_dir
        .join(platform.runtime_id())
        .join("native");

    let variants: Vec<&str> = match kind {
        BackendKind::Gpu => vec![GPU_VARIANT_DIR],
        BackendKind::Cpu => probe
            .cpu_tier()
            .fallbacks()
            .map(|tier| tier.dir_name())
            .collect(),
    };

    for variant in &variants {
        let candidate = native_root.join(variant).join(&file_name);
        if probe.path_exists(&candidate) {
            debug!("Resolved {} library at {}", kind, candidate.display());
            return candidate;
        }
    }

    let default_variant = match kind {
        BackendKind::Gpu => GPU_VARIANT_DIR,
        BackendKind::Cpu => CpuTier::NoAvx.dir_name(),
    };
    native_root.join(default_variant).join(file_name)
}

/// Expand `$VAR`, `${VAR}` and `%VAR%`. Unknown variables are left as written.
pub fn expand_env_vars(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '$' && i + 1 < chars.len() {
            if chars[i + 1] == '{' {
                if let Some(end) = chars[i + 2..].iter().position(|ch| *ch == '}') {
                    let name: String = chars[i + 2..i + 2 + end].iter().collect();
                    match lookup(&name) {
                        Some(value) => out.push_str(&value),
                        None => out.extend(&chars[i..i + 3 + end]),
                    }
                    i += 3 + end;
                    continue;
                }
            } else {
                let len = chars[i + 1..]
                    .iter()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || **ch == '_')
                    .count();
                if len > 0 {
                    let name: String = chars[i + 1..i + 1 + len].iter().collect();
                    match lookup(&name) {
                        Some(value) => out.push_str(&value),
                        None => out.extend(&chars[i..i + 1 + len]),
                    }
                    i += 1 + len;
                    continue;
                }
            }
        } else if c == '%' {
            if let Some(end) = chars[i + 1..].iter().position(|ch| *ch == '%') {
                let name: String = chars[i + 1..i + 1 + end].iter().collect();
                if !name.is_empty() {
                    if let Some(value) = lookup(&name) {
                        out.push_str(&value);
                        i += 2 + end;
                        continue;
                    }
                }
            }
        }
        out.push(c);
        i += 1;
    }

    out
}
