//! Rewriting of `go test` file-output flags for in-guest execution.
//!
//! Test binaries write profiles with flags like
//! `-test.coverprofile=cover.out`. Inside the guest that host path means
//! nothing, so each file-output flag value is replaced with a synthetic
//! guest console device, and the original host path is registered as
//! that console's output file. `-test.outputdir` is pointed at the
//! guest's `/tmp` and its original value is folded into the registered
//! host paths instead.

use std::path::PathBuf;

use crate::console::{HostConsole, guest_path};

/// File-output flags that get a console substituted, `KEY=VALUE` form.
const FILE_FLAGS: &[&str] = &[
    "-test.blockprofile",
    "-test.coverprofile",
    "-test.cpuprofile",
    "-test.memprofile",
    "-test.mutexprofile",
    "-test.trace",
];

/// The output-directory flag, rewritten to the guest scratch directory.
const OUTPUT_DIR_FLAG: &str = "-test.outputdir";

/// Result of one rewrite pass.
#[derive(Debug, Default)]
pub struct Rewrite {
    /// The argument vector to hand to the guest binary.
    pub args: Vec<String>,
    /// Consoles to register, in guest index order starting at 1.
    pub consoles: Vec<HostConsole>,
}

/// Splits a `-flag=value` argument when the flag name matches `flag`.
fn flag_value<'a>(arg: &'a str, flag: &str) -> Option<&'a str> {
    arg.strip_prefix(flag)?.strip_prefix('=')
}

/// Rewrites file-output flags in `args`.
///
/// A flag whose value cannot be extracted (`-test.coverprofile` without
/// `=`) is left untouched. Relative output paths are resolved against a
/// `-test.outputdir` value found anywhere in the argument list; absolute
/// paths are registered as-is.
pub fn rewrite_test_flags(args: &[String]) -> Rewrite {
    // The output dir applies to file flags before and after it.
    let output_dir = args
        .iter()
        .rev()
        .find_map(|arg| flag_value(arg, OUTPUT_DIR_FLAG))
        .map(PathBuf::from);

    let mut out = Rewrite::default();
    for arg in args {
        if flag_value(arg, OUTPUT_DIR_FLAG).is_some() {
            out.args.push(format!("{OUTPUT_DIR_FLAG}=/tmp"));
            continue;
        }

        let rewritten = FILE_FLAGS.iter().find_map(|flag| {
            let value = flag_value(arg, flag)?;
            if value.is_empty() {
                return None;
            }
            let host_path = match &output_dir {
                Some(dir) if !value.starts_with('/') => dir.join(value),
                _ => PathBuf::from(value),
            };
            out.consoles.push(HostConsole {
                host_path,
                must_produce: true,
            });
            Some(format!("{flag}={}", guest_path(out.consoles.len())))
        });

        out.args.push(rewritten.unwrap_or_else(|| arg.clone()));
    }
    out
}
