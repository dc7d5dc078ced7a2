//! Complete Compilation Pipeline
//!
//! Orchestrates the whole toolchain for one script and its imports:
//!
//! 1. **Parse**: main file first, then imports in encounter order
//! 2. **Lint**: semantic validation across the unit
//! 3. **Lower + allocate + resolve**: one function at a time, in source
//!    order, fixing each function's entry address as it is reached
//! 4. **Global resolution**: patch `@NAME`/`&NAME` across the laid-out unit
//! 5. **Render + encode**: the `.asm` listing and the big-endian image
//!
//! Per-function work is independent, but address assignment and the global
//! pass depend on source order, so the pipeline runs strictly sequentially
//! to keep call displacements deterministic.

use crate::compiler::allocator::allocate_registers;
use crate::compiler::codegen::CodeGenerator;
use crate::compiler::encoder::Encoder;
use crate::compiler::instruction::Line;
use crate::compiler::linter::Linter;
use crate::compiler::parser::Parser;
use crate::compiler::regions::Region;
use crate::compiler::resolver::{finalize_function, resolve_references};
use crate::compiler::{ast::SourceFile, error::CompileError};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Summary counters for one build.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BuildStats {
    pub functions: usize,
    pub instructions: usize,
    pub table_words: usize,
    pub image_bytes: usize,
}

/// Everything a successful build produces.
pub struct BuildOutput {
    pub asm: String,
    pub image: Vec<u8>,
    pub stats: BuildStats,
}

/// Load and parse the main script plus every transitive import.
///
/// Import paths resolve against the main script's directory. Duplicate and
/// self imports are fatal, matching the batch one-shot model.
pub fn load_unit(path: &Path) -> Result<Vec<SourceFile>> {
    let base_dir: PathBuf = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut files: Vec<SourceFile> = Vec::new();
    let mut seen: Vec<PathBuf> = Vec::new();
    let mut queue: Vec<PathBuf> = vec![path.to_path_buf()];

    while let Some(next) = queue.pop() {
        let canonical = next
            .canonicalize()
            .with_context(|| format!("No such file: '{}'", next.display()))?;
        if seen.contains(&canonical) {
            // a file reached through two import chains is loaded once
            continue;
        }
        seen.push(canonical.clone());

        let source = std::fs::read_to_string(&next)
            .with_context(|| format!("Failed to read '{}'", next.display()))?;
        let file = Parser::from_source(&next, &source)
            .and_then(|parser| parser.parse())
            .with_context(|| format!("[{}]", file_name(&next)))?;

        let mut direct: Vec<PathBuf> = Vec::new();
        for (import, line) in file.imports.iter().rev() {
            let target = base_dir.join(import);
            let resolved = target
                .canonicalize()
                .with_context(|| format!("No such file: '{}' (line {})", import, line))?;
            if resolved == canonical {
                bail!("[{}] Attempted self-import (line {})", file_name(&next), line);
            }
            if direct.contains(&resolved) {
                bail!("[{}] Duplicate import (line {})", file_name(&next), line);
            }
            direct.push(resolved);
            queue.push(target);
        }
        files.push(file);
    }
    Ok(files)
}

/// Validate a parsed unit; the main file's region governs resolution.
pub fn lint_unit(files: &[SourceFile]) -> Result<Region> {
    let region: Region = files[0].region;
    let mut linter = Linter::new(region);
    for file in files {
        linter
            .check_file(file)
            .with_context(|| format!("[{}]", file_name(&file.path)))?;
    }
    linter
        .finish()
        .with_context(|| format!("[{}]", file_name(&files[0].path)))?;
    Ok(region)
}

/// Compile a validated unit into its listing and image.
pub fn assemble_unit(
    files: &[SourceFile],
    region: Region,
    start_addr: u32,
) -> Result<BuildOutput, CompileError> {
    log::info!("Assembling at {:#010x} for region {}...", start_addr, region);

    let mut codegen = CodeGenerator::new();
    let mut functions: HashMap<String, u32> = HashMap::new();
    let mut lines: Vec<Line> = Vec::new();
    let mut function_count: usize = 0;

    for file in files {
        for function in &file.functions {
            let address: u32 = start_addr + 4 * lines.len() as u32;
            functions.insert(function.name.clone(), address);
            log::debug!("{} at {:#010x}", function.name, address);

            let mut lowered = codegen.lower_function(function)?;
            let alloc = allocate_registers(&mut lowered)?;
            finalize_function(&mut lowered, alloc, address)?;
            lines.extend(lowered.lines);
            function_count += 1;
        }
    }

    log::info!("Resolving cross-function references...");
    resolve_references(&mut lines, &functions, region)?;

    let mut asm = String::with_capacity(lines.len() * 24);
    for line in &lines {
        asm.push_str(&line.to_string());
        asm.push('\n');
    }

    log::info!("Encoding {} words...", lines.len());
    let mut encoder = Encoder::new(start_addr);
    let image = encoder.encode(&lines)?;

    let table_words = lines.iter().filter(|l| matches!(l, Line::Word(_))).count();
    let stats = BuildStats {
        functions: function_count,
        instructions: lines.len() - table_words,
        table_words,
        image_bytes: image.len(),
    };
    log::info!(
        "Done: {} functions, {} instructions, {} table words, {} bytes",
        stats.functions,
        stats.instructions,
        stats.table_words,
        stats.image_bytes
    );

    Ok(BuildOutput { asm, image, stats })
}

/// Full pipeline from a script path to the build outputs.
pub fn build(path: &Path, start_addr: u32) -> Result<BuildOutput> {
    log::info!("Parsing {}...", path.display());
    let files = load_unit(path)?;
    log::info!("Linting {} file(s)...", files.len());
    let region = lint_unit(&files)?;
    let output = assemble_unit(&files, region, start_addr)?;
    Ok(output)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
