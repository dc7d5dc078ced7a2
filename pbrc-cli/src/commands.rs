// CLI command handlers
use anyhow::{bail, Context, Result};
use pbrc_core::compiler::pipeline::{self, BuildOutput};
use std::fs;
use std::path::Path;

/// Lint and parse a script without writing anything.
pub fn check_script(script: &Path) -> Result<()> {
    validate_extension(script)?;
    let files = pipeline::load_unit(script)?;
    let region = pipeline::lint_unit(&files)?;
    let functions: usize = files.iter().map(|f| f.functions.len()).sum();
    println!(
        "OK: {} file(s), {} function(s), region {}",
        files.len(),
        functions,
        region
    );
    Ok(())
}

/// Full build: compile `script` at `address`, writing `<name>.asm` and
/// `<name>.bin` next to it (plus `<name>.stats.json` when requested).
///
/// Nothing is written unless the whole pipeline succeeds.
pub fn build_script(script: &Path, address: u32, emit_stats: bool) -> Result<()> {
    validate_extension(script)?;
    // valid targets live in [0x80000000, 0xFFFFFFFF]; the upper bound is the
    // u32 maximum, so only the floor needs checking
    if address < 0x8000_0000 {
        bail!("Address out of bounds");
    }

    let BuildOutput { asm, image, stats } = pipeline::build(script, address)?;

    let asm_path = script.with_extension("asm");
    let bin_path = script.with_extension("bin");
    fs::write(&asm_path, asm)
        .with_context(|| format!("Failed to write '{}'", asm_path.display()))?;
    fs::write(&bin_path, image)
        .with_context(|| format!("Failed to write '{}'", bin_path.display()))?;
    log::info!(
        "wrote {} and {}",
        asm_path.display(),
        bin_path.display()
    );

    if emit_stats {
        let stats_path = script.with_extension("stats.json");
        let json = serde_json::to_string_pretty(&stats)?;
        fs::write(&stats_path, json)
            .with_context(|| format!("Failed to write '{}'", stats_path.display()))?;
    }

    println!(
        "Built successfully: {} function(s), {} bytes at {:#010x}",
        stats.functions, stats.image_bytes, address
    );
    Ok(())
}

fn validate_extension(script: &Path) -> Result<()> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("pbr") => Ok(()),
        other => bail!(
            "File must be of type '.pbr', not '{}'",
            other.map(|e| format!(".{}", e)).unwrap_or_default()
        ),
    }
}
