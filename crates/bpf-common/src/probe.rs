//! Probe declarations and the attach seam.

use std::{borrow::Cow, fmt};

use serde::Serialize;

use crate::{
    program::ProgramError,
    symbols::{SymbolResolver, syscall_candidates},
};

/// Where a probe fires: on function entry (kprobe) or return (kretprobe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachKind {
    Entry,
    Exit,
}

impl fmt::Display for AttachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachKind::Entry => write!(f, "kprobe"),
            AttachKind::Exit => write!(f, "kretprobe"),
        }
    }
}

/// Kernel symbol a probe is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "kebab-case")]
pub enum KernelSymbol {
    /// A plain kernel function, used as-is.
    Function(Cow<'static, str>),
    /// A syscall name, expanded to the architecture specific wrappers.
    Syscall(Cow<'static, str>),
}

impl KernelSymbol {
    pub const fn function(name: &'static str) -> Self {
        Self::Function(Cow::Borrowed(name))
    }

    pub const fn syscall(name: &'static str) -> Self {
        Self::Syscall(Cow::Borrowed(name))
    }

    /// Concrete kernel symbols to look for, in order of preference.
    pub fn candidates(&self) -> Vec<String> {
        match self {
            KernelSymbol::Function(name) => vec![name.to_string()],
            KernelSymbol::Syscall(name) => syscall_candidates(name),
        }
    }

    /// First candidate present in the running kernel.
    pub fn resolve(&self, resolver: &dyn SymbolResolver) -> Option<String> {
        self.candidates()
            .into_iter()
            .find(|candidate| resolver.resolve(candidate).is_some())
    }
}

impl fmt::Display for KernelSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSymbol::Function(name) => write!(f, "{name}"),
            KernelSymbol::Syscall(name) => write!(f, "syscall:{name}"),
        }
    }
}

/// One candidate probe of a hook point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    pub kind: AttachKind,
    pub symbol: KernelSymbol,
    /// Name of the program inside the object file. Derived from the hook
    /// point name when missing.
    pub program: Option<Cow<'static, str>>,
}

impl ProbeSpec {
    pub const fn entry(symbol: KernelSymbol) -> Self {
        Self {
            kind: AttachKind::Entry,
            symbol,
            program: None,
        }
    }

    pub const fn exit(symbol: KernelSymbol) -> Self {
        Self {
            kind: AttachKind::Exit,
            symbol,
            program: None,
        }
    }

    pub fn program(mut self, program: &'static str) -> Self {
        self.program = Some(Cow::Borrowed(program));
        self
    }

    pub fn program_name(&self, hook_point: &str) -> String {
        match &self.program {
            Some(program) => program.to_string(),
            None => format!("{}_{hook_point}", self.kind),
        }
    }
}

/// Attaches programs to kernel symbols.
///
/// The aya backend is [`crate::program::AyaAttacher`]; tests use a fake
/// kernel recording every call.
pub trait ProbeAttacher: Send {
    type Link: Send;

    fn attach(
        &mut self,
        program: &str,
        kind: AttachKind,
        symbol: &str,
    ) -> Result<Self::Link, ProgramError>;

    fn detach(&mut self, link: Self::Link) -> Result<(), ProgramError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_name() {
        let probe = ProbeSpec::exit(KernelSymbol::function("do_fork"));
        assert_eq!(probe.program_name("do_fork"), "kretprobe_do_fork");
        let probe = ProbeSpec::entry(KernelSymbol::syscall("execve")).program("execve_entry");
        assert_eq!(probe.program_name("sys_execve"), "execve_entry");
    }

    #[test]
    fn resolve_first_present() {
        let resolver = |name: &str| (name == "sys_execve").then_some(1);
        let symbol = KernelSymbol::syscall("execve");
        assert_eq!(symbol.resolve(&resolver), Some("sys_execve".to_string()));
        assert_eq!(KernelSymbol::syscall("execveat").resolve(&resolver), None);
        assert_eq!(
            KernelSymbol::function("do_exit").candidates(),
            vec!["do_exit".to_string()]
        );
    }
}
