/// What a `WaitGroup` does once it has detected misuse and restored its state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnMisuse {
    /// Print the diagnostic to stderr and abort the process.
    #[default]
    Abort,
    /// Panic with the diagnostic, leaving the unwind to the caller.
    Panic,
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Label carried in diagnostics and log lines.
    pub name: Option<String>,
    pub on_misuse: OnMisuse,
}
