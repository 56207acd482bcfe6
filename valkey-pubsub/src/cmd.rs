use std::fmt;

/// A command argument builder.
///
/// Commands are handed to the transport as structured arguments; the wire
/// encoding is the transport's concern.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Shortcut function to creating a command with a single argument.
///
/// The first argument of a command is always the name of the command.
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pieces: Vec<_> = self
            .args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg))
            .collect();
        f.debug_tuple("Cmd").field(&pieces).finish()
    }
}

impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd::default()
    }

    /// Appends an argument to the command.
    pub fn arg(&mut self, arg: impl Into<Vec<u8>>) -> &mut Cmd {
        self.args.push(arg.into());
        self
    }

    /// Appends every item of an iterator as a separate argument.
    pub fn arg_each(&mut self, args: impl IntoIterator<Item = impl Into<Vec<u8>>>) -> &mut Cmd {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Returns the command name, i.e. the first argument, uppercased.
    pub fn command(&self) -> Option<Vec<u8>> {
        self.args.first().map(|name| name.to_ascii_uppercase())
    }

    /// Returns the argument at `idx`, where index 0 is the command name.
    pub fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        self.args.get(idx).map(|arg| arg.as_slice())
    }

    /// Returns an iterator over all arguments, including the command name.
    pub fn args_iter(&self) -> impl ExactSizeIterator<Item = &[u8]> {
        self.args.iter().map(|arg| arg.as_slice())
    }

    /// Builds a command from pre-split arguments, as used by custom commands.
    pub fn from_args(args: impl IntoIterator<Item = impl Into<Vec<u8>>>) -> Cmd {
        let mut rv = Cmd::new();
        rv.arg_each(args);
        rv
    }
}
