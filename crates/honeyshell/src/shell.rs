//! The pseudo-shell: a read-eval loop that never executes anything.
//!
//! Input lines are classified against a closed [`CommandTable`] of pure
//! output functions. Unknown commands get the usual "command not found"
//! answer, so the session looks alive while capturing everything typed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::recorder::{NullRecorder, TerminalRecorder};
use crate::terminal::{LineTerminal, TerminalError};

/// Identity the built-in commands answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellContext {
    /// Authenticated user name.
    pub user: String,
    /// Host name the honeypot pretends to be.
    pub hostname: String,
}

impl ShellContext {
    fn home(&self) -> String {
        if self.user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.user)
        }
    }

    fn uid(&self) -> u32 {
        if self.user == "root" { 0 } else { 1000 }
    }
}

/// A built-in command: arguments (without the command name) to output.
pub type Builtin = fn(&[&str], &ShellContext) -> String;

const KERNEL_RELEASE: &str = "5.15.0-91-generic";
const KERNEL_VERSION: &str = "#101-Ubuntu SMP Tue Nov 14 13:30:08 UTC 2023";

fn builtin_ls(_args: &[&str], _ctx: &ShellContext) -> String {
    String::new()
}

fn builtin_pwd(_args: &[&str], ctx: &ShellContext) -> String {
    format!("{}\n", ctx.home())
}

fn builtin_whoami(_args: &[&str], ctx: &ShellContext) -> String {
    format!("{}\n", ctx.user)
}

fn builtin_id(_args: &[&str], ctx: &ShellContext) -> String {
    let uid = ctx.uid();
    let user = &ctx.user;
    format!("uid={uid}({user}) gid={uid}({user}) groups={uid}({user})\n")
}

fn builtin_uname(args: &[&str], ctx: &ShellContext) -> String {
    match args.first().copied() {
        Some("-a") => format!(
            "Linux {} {KERNEL_RELEASE} {KERNEL_VERSION} x86_64 x86_64 x86_64 GNU/Linux\n",
            ctx.hostname
        ),
        Some("-r") => format!("{KERNEL_RELEASE}\n"),
        Some("-n") => format!("{}\n", ctx.hostname),
        _ => "Linux\n".to_string(),
    }
}

fn builtin_hostname(_args: &[&str], ctx: &ShellContext) -> String {
    format!("{}\n", ctx.hostname)
}

fn builtin_echo(args: &[&str], _ctx: &ShellContext) -> String {
    format!("{}\n", args.join(" "))
}

/// Mapping from command name to built-in behavior.
#[derive(Clone)]
pub struct CommandTable {
    commands: HashMap<String, Builtin>,
}

impl CommandTable {
    /// Creates a table with no commands.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Adds or replaces a command.
    pub fn insert(&mut self, name: impl Into<String>, builtin: Builtin) -> &mut Self {
        self.commands.insert(name.into(), builtin);
        self
    }

    /// Looks up a command by name.
    pub fn get(&self, name: &str) -> Option<Builtin> {
        self.commands.get(name).copied()
    }

    /// Returns the command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table
            .insert("ls", builtin_ls)
            .insert("pwd", builtin_pwd)
            .insert("whoami", builtin_whoami)
            .insert("id", builtin_id)
            .insert("uname", builtin_uname)
            .insert("hostname", builtin_hostname)
            .insert("echo", builtin_echo);
        table
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.names())
            .finish()
    }
}

/// Result of evaluating one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing to print.
    Silent,
    /// Text to print (may be empty for quiet built-ins).
    Output(String),
    /// The user asked to leave.
    Logout,
}

/// Why the read-eval loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// `logout` or `quit`.
    Logout,
    /// The terminal could not be read or written.
    Terminal(TerminalError),
}

/// Settings shared by every shell of a server.
#[derive(Clone)]
pub struct ShellSettings {
    /// Prompt printed before each line.
    pub prompt: String,
    /// Host name reported by built-ins.
    pub hostname: String,
    /// Built-in commands.
    pub commands: Arc<CommandTable>,
    /// Sink that records terminal traffic.
    pub recorder: Arc<dyn TerminalRecorder>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            prompt: "$ ".to_string(),
            hostname: "ubuntu".to_string(),
            commands: Arc::new(CommandTable::default()),
            recorder: Arc::new(NullRecorder),
        }
    }
}

impl fmt::Debug for ShellSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSettings")
            .field("prompt", &self.prompt)
            .field("hostname", &self.hostname)
            .field("commands", &self.commands)
            .finish()
    }
}

/// An interactive pseudo-shell for one channel.
pub struct PseudoShell {
    context: ShellContext,
    commands: Arc<CommandTable>,
    label: String,
}

impl PseudoShell {
    /// Creates a shell answering as `context`.
    pub fn new(context: ShellContext, commands: Arc<CommandTable>) -> Self {
        Self {
            context,
            commands,
            label: String::new(),
        }
    }

    /// Sets the session label used in log events.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns the shell's context.
    pub fn context(&self) -> &ShellContext {
        &self.context
    }

    /// Classifies one line of input. Never fails.
    pub fn evaluate(&self, line: &str) -> Evaluation {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Evaluation::Silent;
        }
        if trimmed == "logout" || trimmed == "quit" {
            return Evaluation::Logout;
        }

        let mut tokens = trimmed.split_whitespace();
        let Some(name) = tokens.next() else {
            return Evaluation::Silent;
        };
        let args: Vec<&str> = tokens.collect();

        match self.commands.get(name) {
            Some(builtin) => Evaluation::Output(builtin(&args, &self.context)),
            None => Evaluation::Output(format!("{name}: command not found\n")),
        }
    }

    /// Runs the read-eval loop until logout or terminal failure.
    pub async fn run<T: LineTerminal + ?Sized>(&self, terminal: &mut T) -> ShellExit {
        loop {
            let line = match terminal.read_line().await {
                Ok(line) => line,
                Err(e) => {
                    debug!(session = %self.label, user = %self.context.user, error = %e, "Shell input ended");
                    return ShellExit::Terminal(e);
                }
            };
            info!(
                session = %self.label,
                user = %self.context.user,
                command = %line,
                "Typed command"
            );

            match self.evaluate(&line) {
                Evaluation::Silent => {}
                Evaluation::Logout => {
                    info!(session = %self.label, user = %self.context.user, "User logged out");
                    return ShellExit::Logout;
                }
                Evaluation::Output(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = terminal.write(text.as_bytes()) {
                        return ShellExit::Terminal(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Terminal fed from a script that records everything written.
    struct ScriptedTerminal {
        lines: VecDeque<Result<String, TerminalError>>,
        written: Vec<u8>,
        reads: usize,
    }

    impl ScriptedTerminal {
        fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| Ok((*l).to_string())).collect(),
                written: Vec::new(),
                reads: 0,
            }
        }

        fn written(&self) -> &str {
            std::str::from_utf8(&self.written).unwrap()
        }
    }

    #[async_trait]
    impl LineTerminal for ScriptedTerminal {
        async fn read_line(&mut self) -> Result<String, TerminalError> {
            self.reads += 1;
            self.lines.pop_front().unwrap_or(Err(TerminalError::Closed))
        }

        fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
            self.written.extend_from_slice(data);
            Ok(())
        }
    }

    fn shell(user: &str) -> PseudoShell {
        PseudoShell::new(
            ShellContext {
                user: user.to_string(),
                hostname: "web01".to_string(),
            },
            Arc::new(CommandTable::default()),
        )
    }

    #[tokio::test]
    async fn test_whitespace_only_input_is_silent() {
        let mut term = ScriptedTerminal::new(&["   "]);
        let exit = shell("admin").run(&mut term).await;
        assert_eq!(exit, ShellExit::Terminal(TerminalError::Closed));
        assert_eq!(term.written(), "");
        // The loop kept reading after the blank line.
        assert_eq!(term.reads, 2);
    }

    #[tokio::test]
    async fn test_logout_ends_loop_without_output() {
        let mut term = ScriptedTerminal::new(&["logout", "whoami"]);
        let exit = shell("admin").run(&mut term).await;
        assert_eq!(exit, ShellExit::Logout);
        assert_eq!(term.written(), "");
        assert_eq!(term.reads, 1);
    }

    #[tokio::test]
    async fn test_quit_with_padding_ends_loop() {
        let mut term = ScriptedTerminal::new(&["  quit  "]);
        assert_eq!(shell("admin").run(&mut term).await, ShellExit::Logout);
    }

    #[tokio::test]
    async fn test_unknown_command_reports_first_token() {
        let mut term = ScriptedTerminal::new(&["foo bar"]);
        shell("admin").run(&mut term).await;
        assert_eq!(term.written(), "foo: command not found\n");
    }

    #[tokio::test]
    async fn test_ls_is_quiet() {
        let mut term = ScriptedTerminal::new(&["ls -la /etc"]);
        shell("admin").run(&mut term).await;
        assert_eq!(term.written(), "");
    }

    #[tokio::test]
    async fn test_read_error_ends_loop() {
        let mut term = ScriptedTerminal::new(&[]);
        term.lines.push_back(Err(TerminalError::EndOfInput));
        term.lines.push_back(Ok("whoami".to_string()));
        let exit = shell("admin").run(&mut term).await;
        assert_eq!(exit, ShellExit::Terminal(TerminalError::EndOfInput));
        assert_eq!(term.written(), "");
    }

    #[test]
    fn test_builtins() {
        let sh = shell("root");
        assert_eq!(sh.evaluate("whoami"), Evaluation::Output("root\n".into()));
        assert_eq!(sh.evaluate("pwd"), Evaluation::Output("/root\n".into()));
        assert_eq!(
            sh.evaluate("id"),
            Evaluation::Output("uid=0(root) gid=0(root) groups=0(root)\n".into())
        );
        assert_eq!(sh.evaluate("echo  a   b"), Evaluation::Output("a b\n".into()));
        assert_eq!(sh.evaluate("hostname"), Evaluation::Output("web01\n".into()));
        assert_eq!(sh.evaluate("uname"), Evaluation::Output("Linux\n".into()));
        match sh.evaluate("uname -a") {
            Evaluation::Output(text) => assert!(text.starts_with("Linux web01 ")),
            other => panic!("unexpected {other:?}"),
        }

        let user = shell("pi");
        assert_eq!(user.evaluate("pwd"), Evaluation::Output("/home/pi\n".into()));
    }

    #[test]
    fn test_exact_builtin_names() {
        let sh = shell("admin");
        assert_eq!(
            sh.evaluate("lsblk"),
            Evaluation::Output("lsblk: command not found\n".into())
        );
        assert_eq!(
            sh.evaluate("logout now"),
            Evaluation::Output("logout: command not found\n".into())
        );
    }

    #[test]
    fn test_malformed_input_is_total() {
        let sh = shell("admin");
        for line in ["\u{0}", "\t\t", ";;;", "$(reboot)", "\u{202e}evil", "a\u{0}b c"] {
            let _ = sh.evaluate(line);
        }
        assert_eq!(sh.evaluate("\t\t"), Evaluation::Silent);
    }

    #[test]
    fn test_command_table_is_extensible() {
        fn uptime(_args: &[&str], _ctx: &ShellContext) -> String {
            " 10:00:00 up 42 days\n".to_string()
        }
        let mut table = CommandTable::default();
        table.insert("uptime", uptime);
        assert!(table.names().contains(&"uptime"));

        let sh = PseudoShell::new(
            ShellContext {
                user: "admin".into(),
                hostname: "h".into(),
            },
            Arc::new(table),
        );
        assert_eq!(
            sh.evaluate("uptime"),
            Evaluation::Output(" 10:00:00 up 42 days\n".into())
        );
    }
}
