//! `dimmon.conf` parsing and the built-in type registrar.
//!
//! The original loads modules as shared objects (`dmm_module_load`, one
//! `dlopen` per config line) and leaves the starter's own data format up to
//! the starter type. This crate keeps the file format (module lines, a bare
//! `==` separator, a starter-type line, a second bare `==`, then the
//! verbatim remainder as the starter's descriptor, §6) but resolves module
//! names against a fixed, compile-time table of built-in types instead of
//! `dlopen`: this process ships a closed set of node types, not a plugin
//! host, so a static table is the table `dlopen` would have populated at
//! runtime anyway, minus the ability to add new `.so` files without a
//! rebuild.

use dimmon_error::{DmmError, DmmResult};
use dimmon_registry::TypeRegistry;
use std::rc::Rc;

/// The parsed shape of a config file: the module names it named (already
/// resolved against the built-in table), the starter type, and the
/// descriptor text to hand that starter on `STARTUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConfig {
    pub modules: Vec<String>,
    pub starter_type: String,
    pub descriptor: String,
    /// The line number the descriptor begins at, for the starter's own
    /// diagnostics (mirrors the original handing `dmm_startup` a `lineno`).
    pub lineno: u32,
}

/// Registers every built-in type this process ships under its canonical
/// name. Grounded in the original's module set: `sensors/dummy` → `source`,
/// `blackhole`/`dbgprinter` → `sink`, `wavebuf` → `wavebuf`, `starter` →
/// `starter`.
pub fn register_builtin_types(registry: &mut TypeRegistry) -> DmmResult<()> {
    registry.register("source", Rc::new(dimmon_nodes::Source::new(42, b"hi".to_vec())))?;
    registry.register("sink", Rc::new(dimmon_nodes::Sink::new()))?;
    registry.register("wavebuf", Rc::new(dimmon_nodes::WaveBuf))?;
    registry.register("starter", Rc::new(dimmon_nodes::Starter))?;
    Ok(())
}

/// Resolves `name` against the built-in table used by [`register_builtin_types`].
fn is_known_module(name: &str) -> bool {
    matches!(name, "source" | "sink" | "wavebuf" | "starter")
}

/// Parses the full contents of a `dimmon.conf`-shaped file.
///
/// Lines before the first bare `==` are module names; blank lines, `#`
/// comments and Lua-style `--` comments are skipped, matching the original's
/// lexing. An unrecognized module name is logged and skipped rather than
/// failing the whole parse — mirrors the original's "module load failed,
/// keep going" behavior. The line immediately after that `==` is the starter
/// type; the line after that must itself be a bare `==`; everything
/// remaining in the file, verbatim, is the descriptor.
pub fn parse_config(contents: &str) -> DmmResult<ParsedConfig> {
    let mut lines = contents.lines().enumerate().map(|(i, l)| (i as u32 + 1, l));
    let mut modules = Vec::new();

    let starter_type = loop {
        let (lineno, line) = lines.next().ok_or(DmmError::InvalidArgument)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("--") {
            continue;
        }
        if trimmed == "==" {
            let (_, starter_line) = lines.next().ok_or(DmmError::InvalidArgument)?;
            break starter_line.trim_end().to_string();
        }
        if is_known_module(trimmed) {
            modules.push(trimmed.to_string());
        } else {
            tracing::warn!(lineno, module = trimmed, "unknown module name, skipping");
        }
    };

    if starter_type.is_empty() {
        return Err(DmmError::InvalidArgument);
    }

    let (lineno, separator) = lines.next().ok_or(DmmError::InvalidArgument)?;
    if separator.trim_end() != "==" {
        return Err(DmmError::InvalidArgument);
    }

    let descriptor: String = lines.map(|(_, l)| l).collect::<Vec<_>>().join("\n");

    Ok(ParsedConfig {
        modules,
        starter_type,
        descriptor,
        lineno: lineno + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modules_starter_type_and_descriptor() {
        let conf = "\
# comment
source
sink
==
starter
==
create src source
create dst sink
connect src:out -> dst:in
";
        let parsed = parse_config(conf).unwrap();
        assert_eq!(parsed.modules, vec!["source", "sink"]);
        assert_eq!(parsed.starter_type, "starter");
        assert!(parsed.descriptor.contains("connect src:out -> dst:in"));
    }

    #[test]
    fn unknown_module_is_skipped_not_fatal() {
        let conf = "totally-unknown-module\n==\nstarter\n==\n";
        let parsed = parse_config(conf).unwrap();
        assert!(parsed.modules.is_empty());
        assert_eq!(parsed.starter_type, "starter");
    }

    #[test]
    fn missing_second_separator_is_invalid_argument() {
        let conf = "source\n==\nstarter\nnot-a-separator\n";
        assert_eq!(parse_config(conf), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn missing_starter_type_is_invalid_argument() {
        let conf = "source\n==\n";
        assert_eq!(parse_config(conf), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn register_builtin_types_populates_all_four() {
        let mut registry = TypeRegistry::new();
        register_builtin_types(&mut registry).unwrap();
        assert!(registry.lookup("source").is_some());
        assert!(registry.lookup("sink").is_some());
        assert!(registry.lookup("wavebuf").is_some());
        assert!(registry.lookup("starter").is_some());
    }
}
