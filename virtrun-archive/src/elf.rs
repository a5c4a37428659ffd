//! Guest architecture inference from ELF identification headers.
//!
//! Only the identification bytes and the machine field are inspected;
//! everything else about the binary is the dynamic linker's business.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

/// `EI_OSABI` value for System V / unspecified.
const OSABI_NONE: u8 = 0;

/// `EI_OSABI` value for Linux (GNU).
const OSABI_LINUX: u8 = 3;

/// `e_machine` for x86-64.
const EM_X86_64: u16 = 62;

/// `e_machine` for AArch64.
const EM_AARCH64: u16 = 183;

/// `e_machine` for RISC-V.
const EM_RISCV: u16 = 243;

/// Guest instruction set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Arch {
    /// x86-64.
    Amd64,
    /// 64-bit ARM.
    Arm64,
    /// 64-bit RISC-V.
    Riscv64,
}

impl Arch {
    /// Returns `true` when this is the architecture of the host itself.
    pub fn is_native_host(self) -> bool {
        match self {
            Self::Amd64 => cfg!(target_arch = "x86_64"),
            Self::Arm64 => cfg!(target_arch = "aarch64"),
            Self::Riscv64 => cfg!(target_arch = "riscv64"),
        }
    }

    /// Returns `true` when hardware acceleration is usable for this
    /// guest architecture: native, and the KVM device is writable.
    pub fn kvm_available(self) -> bool {
        self.is_native_host()
            && std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/kvm")
                .is_ok()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Riscv64 => "riscv64",
        })
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "riscv64" => Ok(Self::Riscv64),
            _ => Err(format!("unknown architecture: {s}")),
        }
    }
}

/// Reads the guest architecture from the ELF header of `path`.
///
/// Fails with [`Error::NotElf`] when the magic is absent,
/// [`Error::OsAbiNotSupported`] for OS ABIs other than `NONE`/`LINUX`,
/// and [`Error::MachineNotSupported`] for machines outside the supported
/// set.
pub fn read_elf_arch(path: &Path) -> Result<Arch> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 20];
    file.read_exact(&mut header).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::NotElf {
                path: path.to_path_buf(),
            }
        } else {
            Error::Io(e)
        }
    })?;
    arch_from_header(&header).map_err(|e| match e {
        HeaderError::NotElf => Error::NotElf {
            path: path.to_path_buf(),
        },
        HeaderError::OsAbi(abi) => Error::OsAbiNotSupported {
            path: path.to_path_buf(),
            abi,
        },
        HeaderError::Machine(machine) => Error::MachineNotSupported {
            path: path.to_path_buf(),
            machine,
        },
    })
}

/// Program header type of the interpreter path segment.
const PT_INTERP: u32 = 3;

/// Returns `true` when the ELF at `path` requests a program
/// interpreter, i.e. is dynamically linked.
///
/// Statically linked binaries carry no `PT_INTERP` entry and need no
/// library resolution. The caller is expected to have validated the
/// file with [`read_elf_arch`] first; a malformed program header table
/// reads as "no interpreter" rather than an error.
pub fn has_interpreter(path: &Path) -> Result<bool> {
    use std::io::{Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    let mut ident = [0u8; 64];
    let n = file.read(&mut ident)?;
    if n < 4 || &ident[..4] != b"\x7fELF" {
        return Err(Error::NotElf {
            path: path.to_path_buf(),
        });
    }
    let class64 = ident[4] == 2;
    let big_endian = ident[5] == 2;
    let u16_at = |at: usize| -> u16 {
        let bytes = [ident[at], ident[at + 1]];
        if big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    };

    // e_phoff / e_phentsize / e_phnum live at class-dependent offsets.
    let (phoff, phentsize, phnum) = if class64 {
        if n < 58 {
            return Ok(false);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&ident[32..40]);
        let phoff = if big_endian {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        };
        (phoff, u16_at(54), u16_at(56))
    } else {
        if n < 46 {
            return Ok(false);
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&ident[28..32]);
        let phoff = u64::from(if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        });
        (phoff, u16_at(42), u16_at(44))
    };
    if phoff == 0 || phentsize < 4 {
        return Ok(false);
    }

    for idx in 0..u64::from(phnum) {
        file.seek(SeekFrom::Start(phoff + idx * u64::from(phentsize)))?;
        let mut p_type = [0u8; 4];
        if file.read_exact(&mut p_type).is_err() {
            return Ok(false);
        }
        let p_type = if big_endian {
            u32::from_be_bytes(p_type)
        } else {
            u32::from_le_bytes(p_type)
        };
        if p_type == PT_INTERP {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Header-level failure, mapped to [`Error`] with the path attached.
enum HeaderError {
    /// Missing ELF magic.
    NotElf,
    /// Unsupported `EI_OSABI` byte.
    OsAbi(u8),
    /// Unsupported `e_machine` value.
    Machine(u16),
}

/// Decodes the identification bytes and machine field.
fn arch_from_header(header: &[u8; 20]) -> std::result::Result<Arch, HeaderError> {
    if &header[..4] != b"\x7fELF" {
        return Err(HeaderError::NotElf);
    }
    let abi = header[7];
    if abi != OSABI_NONE && abi != OSABI_LINUX {
        return Err(HeaderError::OsAbi(abi));
    }
    // EI_DATA: 1 = little endian, 2 = big endian.
    let machine = match header[5] {
        2 => u16::from_be_bytes([header[18], header[19]]),
        _ => u16::from_le_bytes([header[18], header[19]]),
    };
    match machine {
        EM_X86_64 => Ok(Arch::Amd64),
        EM_AARCH64 => Ok(Arch::Arm64),
        EM_RISCV => Ok(Arch::Riscv64),
        other => Err(HeaderError::Machine(other)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    /// `e_machine` for MIPS, unsupported here.
    const EM_MIPS: u16 = 8;

    /// `EI_OSABI` for FreeBSD, unsupported here.
    const OSABI_FREEBSD: u8 = 9;

    fn toy_header(abi: u8, machine: u16) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[..4].copy_from_slice(b"\x7fELF");
        h[4] = 2; // ELFCLASS64
        h[5] = 1; // little endian
        h[6] = 1; // EV_CURRENT
        h[7] = abi;
        h[18..20].copy_from_slice(&machine.to_le_bytes());
        h
    }

    #[test]
    fn supported_matrix() {
        for abi in [OSABI_NONE, OSABI_LINUX] {
            for (machine, expected) in [
                (EM_X86_64, Arch::Amd64),
                (EM_AARCH64, Arch::Arm64),
                (EM_RISCV, Arch::Riscv64),
            ] {
                let header = toy_header(abi, machine);
                assert!(
                    matches!(arch_from_header(&header), Ok(a) if a == expected),
                    "abi {abi} machine {machine}"
                );
            }
        }
    }

    #[test]
    fn unsupported_machine_fails() {
        for abi in [OSABI_NONE, OSABI_LINUX] {
            let header = toy_header(abi, EM_MIPS);
            assert!(matches!(
                arch_from_header(&header),
                Err(HeaderError::Machine(m)) if m == EM_MIPS
            ));
        }
    }

    #[test]
    fn unsupported_abi_fails() {
        for machine in [EM_X86_64, EM_AARCH64, EM_RISCV, EM_MIPS] {
            let header = toy_header(OSABI_FREEBSD, machine);
            assert!(matches!(
                arch_from_header(&header),
                Err(HeaderError::OsAbi(a)) if a == OSABI_FREEBSD
            ));
        }
    }

    #[test]
    fn missing_magic_fails() {
        let mut header = toy_header(OSABI_NONE, EM_X86_64);
        header[0] = b'M';
        assert!(matches!(arch_from_header(&header), Err(HeaderError::NotElf)));
    }

    #[test]
    fn big_endian_machine_field_is_honored() {
        let mut header = toy_header(OSABI_NONE, 0);
        header[5] = 2;
        header[18..20].copy_from_slice(&EM_RISCV.to_be_bytes());
        assert!(matches!(arch_from_header(&header), Ok(Arch::Riscv64)));
    }

    #[test]
    fn read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&toy_header(OSABI_LINUX, EM_AARCH64))
            .unwrap();
        assert_eq!(read_elf_arch(&path).unwrap(), Arch::Arm64);

        let short = dir.path().join("short");
        std::fs::File::create(&short).unwrap().write_all(b"\x7fEL").unwrap();
        assert!(matches!(read_elf_arch(&short), Err(Error::NotElf { .. })));
    }

    /// Builds a minimal 64-bit ELF with the given program header types.
    fn toy_elf(p_types: &[u32]) -> Vec<u8> {
        let phoff: u64 = 64;
        let phentsize: u16 = 56;
        let mut elf = vec![0u8; 64 + p_types.len() * usize::from(phentsize)];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2; // ELFCLASS64
        elf[5] = 1; // little endian
        elf[6] = 1;
        elf[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        elf[32..40].copy_from_slice(&phoff.to_le_bytes());
        elf[54..56].copy_from_slice(&phentsize.to_le_bytes());
        elf[56..58].copy_from_slice(&(p_types.len() as u16).to_le_bytes());
        for (idx, p_type) in p_types.iter().enumerate() {
            let at = 64 + idx * usize::from(phentsize);
            elf[at..at + 4].copy_from_slice(&p_type.to_le_bytes());
        }
        elf
    }

    #[test]
    fn interpreter_detection() {
        const PT_LOAD: u32 = 1;
        let dir = tempfile::tempdir().unwrap();

        let dynamic = dir.path().join("dynamic");
        std::fs::write(&dynamic, toy_elf(&[PT_LOAD, PT_INTERP, PT_LOAD])).unwrap();
        assert!(has_interpreter(&dynamic).unwrap());

        let static_bin = dir.path().join("static");
        std::fs::write(&static_bin, toy_elf(&[PT_LOAD, PT_LOAD])).unwrap();
        assert!(!has_interpreter(&static_bin).unwrap());

        let no_phdrs = dir.path().join("bare");
        std::fs::write(&no_phdrs, toy_elf(&[])).unwrap();
        assert!(!has_interpreter(&no_phdrs).unwrap());

        let not_elf = dir.path().join("text");
        std::fs::write(&not_elf, b"#!/bin/sh\n").unwrap();
        assert!(matches!(has_interpreter(&not_elf), Err(Error::NotElf { .. })));
    }

    #[test]
    fn arch_string_roundtrip() {
        for arch in [Arch::Amd64, Arch::Arm64, Arch::Riscv64] {
            assert_eq!(arch.to_string().parse::<Arch>().unwrap(), arch);
        }
        assert!("sparc64".parse::<Arch>().is_err());
    }
}
