//! Compiler toolchain for PBR script targeting 32-bit PowerPC.
//!
//! Given a `.pbr` source file and a load address, the pipeline validates the
//! program, lowers it through a register-abstract instruction list, assigns
//! PowerPC registers by liveness and graph coloring, resolves branches,
//! frames, jump tables, and cross-function references, and emits a flat
//! big-endian machine-code image suitable for injection at that address.

pub mod compiler;
