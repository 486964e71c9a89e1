//! Finding the kernel's text range.
//!
//! With a vmlinux image the range comes from `objdump`: the `.text`
//! section header gives the start, the `_etext` symbol the end. Without
//! one, `/proc/kallsyms` is tried, which only has real addresses for
//! privileged users.

use log::{debug, warn};
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::domain::{KernelRange, ToolError};

const OBJDUMP: &str = "objdump";
const KALLSYMS: &str = "/proc/kallsyms";
/// Directory name under `{kern}` when no vmlinux was given
pub const NO_VMLINUX: &str = "no-vmlinux";

/// Kernel range plus the name kernel samples are filed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub range: KernelRange,
    pub name: String,
}

/// Determine the kernel image for a session.
///
/// # Errors
/// Returns an error if `vmlinux` was given but is not a usable image
pub fn detect(vmlinux: Option<&Path>) -> Result<KernelImage, ToolError> {
    match vmlinux {
        Some(path) => {
            let range = from_vmlinux(path)?;
            let name = path.file_name().map_or_else(|| "vmlinux".to_string(), |n| n.to_string_lossy().into_owned());
            Ok(KernelImage { range, name })
        }
        None => {
            let range = fs::read_to_string(KALLSYMS).map(|s| from_kallsyms(&s)).unwrap_or_default();
            if !range.is_known() {
                debug!("Kernel text range unknown; kernel samples rely on the sample's mode flag");
            }
            Ok(KernelImage { range, name: NO_VMLINUX.to_string() })
        }
    }
}

/// Run objdump and return the first stdout line containing `needle`.
///
/// Anything on stderr is fatal only when the line was not found.
fn objdump_line(flag: &str, vmlinux: &Path, needle: &str) -> Result<Option<String>, ToolError> {
    let output = Command::new(OBJDUMP)
        .arg(flag)
        .arg(vmlinux)
        .output()
        .map_err(|source| ToolError::Spawn { tool: OBJDUMP.to_string(), source })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let found = stdout.lines().find(|l| l.contains(needle)).map(str::to_string);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stderr.trim().is_empty() || !output.status.success() {
        let detail = format!("error while getting vmlinux address info: {}", stderr.trim());
        if found.is_none() {
            return Err(ToolError::Failed { tool: OBJDUMP.to_string(), detail });
        }
        warn!("{detail}");
    }
    Ok(found)
}

fn invalid_image(vmlinux: &Path, what: &str) -> ToolError {
    ToolError::Parse {
        tool: OBJDUMP.to_string(),
        detail: format!(
            "Unable to obtain vmlinux {what} address. The specified vmlinux file ({}) does not seem \
             to be valid. Make sure you are using a non-compressed image file (e.g. vmlinux not vmlinuz)",
            vmlinux.display()
        ),
    }
}

/// Kernel text range from a vmlinux image.
///
/// # Errors
/// Returns an error if objdump fails or the image lacks `.text`/`_etext`
pub fn from_vmlinux(vmlinux: &Path) -> Result<KernelRange, ToolError> {
    let start = objdump_line("-h", vmlinux, " .text")?
        .as_deref()
        .and_then(parse_text_start)
        .ok_or_else(|| invalid_image(vmlinux, "start"))?;
    let end = objdump_line("-t", vmlinux, " _etext")?
        .as_deref()
        .and_then(parse_etext)
        .ok_or_else(|| invalid_image(vmlinux, "end"))?;
    debug!("vmlinux text range {start:#x}-{end:#x}");
    Ok(KernelRange { start, end })
}

/// `objdump -h` section line: "  1 .text  00a0  ffffffff81000000  0000..." (4th field)
fn parse_text_start(line: &str) -> Option<u64> {
    u64::from_str_radix(line.split_whitespace().nth(3)?, 16).ok()
}

/// `objdump -t` symbol line: "ffffffff81e00000 g  .text 0000 _etext" (1st field)
fn parse_etext(line: &str) -> Option<u64> {
    u64::from_str_radix(line.split_whitespace().next()?, 16).ok()
}

/// `_stext`..`_etext` from kallsyms content. Unknown if either is missing or zero.
#[must_use]
pub fn from_kallsyms(content: &str) -> KernelRange {
    let mut range = KernelRange::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(_kind), Some(name)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let target = match name {
            "_stext" => &mut range.start,
            "_etext" => &mut range.end,
            _ => continue,
        };
        *target = u64::from_str_radix(addr, 16).unwrap_or(0);
    }
    if range.start == 0 || !range.is_known() {
        return KernelRange::default();
    }
    range
}
