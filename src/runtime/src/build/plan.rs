//! Plan and Command protocol.
//!
//! A [`Plan`] is the ordered list of commands compiled from a Kilnfile. Besides
//! the parsed instructions it carries the implicit COMMIT and CLEANUP steps
//! that turn pending changes into images and reset state between stages.

use super::commands::{new_command, CleanupCommand, CommitCommand};
use super::kilnfile::Instruction;
use super::Build;
use async_trait::async_trait;
use kiln_core::error::Result;
use kiln_core::state::State;
use std::collections::BTreeMap;
use std::fmt;

/// One step of a plan.
#[async_trait]
pub trait Command: Send + Sync + fmt::Display {
    /// Whether the step runs at all. Skipped steps leave the state untouched.
    fn should_run(&self, _build: &Build, _state: &State) -> Result<bool> {
        Ok(true)
    }

    /// Transform the state.
    async fn execute(&self, build: &mut Build, state: State) -> Result<State>;

    /// Steps whose arguments reference environment variables expose this.
    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        None
    }
}

/// Resolve `$VAR` references against the environment built so far.
pub trait EnvReplaceable {
    fn replace_env(&mut self, env: &BTreeMap<String, String>);
}

/// Expand `$VAR` and `${VAR}` in `s`. Unknown variables expand to nothing;
/// `\$` is a literal dollar.
pub fn expand_env(s: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if closed {
                        out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
                    } else {
                        out.push_str("${");
                        out.push_str(&name);
                    }
                }
                Some(n) if n.is_ascii_alphabetic() || *n == '_' => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
                }
                _ => out.push('$'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Where a command sits relative to the implicit commits.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CommitPolicy {
    /// Flush pending changes first
    Before,
    /// Flush pending changes first and commit right after
    Around,
    /// Leave whatever is pending alone
    Never,
    /// Leaves a pending change
    Defer,
}

fn commit_policy(instruction: &Instruction) -> CommitPolicy {
    match instruction {
        Instruction::Run { .. }
        | Instruction::Copy { .. }
        | Instruction::Add { .. }
        | Instruction::Export { .. }
        | Instruction::Import { .. } => CommitPolicy::Around,
        Instruction::Attach { .. } | Instruction::Tag { .. } | Instruction::Push { .. } => {
            CommitPolicy::Before
        }
        Instruction::From { .. } | Instruction::Maintainer { .. } => CommitPolicy::Never,
        _ => CommitPolicy::Defer,
    }
}

/// Ordered, growable list of commands consumed by index.
#[derive(Default)]
pub struct Plan {
    commands: Vec<Box<dyn Command>>,
}

impl Plan {
    /// Compile instructions into a plan.
    ///
    /// A stage ends at the next FROM or at the end of the instructions; its
    /// pending changes are committed and a CLEANUP follows. The CLEANUP of
    /// the last stage is only added with `final_cleanup`, which sub-plans
    /// spliced in mid-run leave off.
    pub fn new(instructions: Vec<Instruction>, final_cleanup: bool) -> Self {
        let mut commands: Vec<Box<dyn Command>> = Vec::with_capacity(instructions.len() * 2);
        let mut committed = true;
        let mut tagged = false;
        let total = instructions.len();
        let mut iter = instructions.into_iter().enumerate().peekable();

        while let Some((i, instruction)) = iter.next() {
            let policy = commit_policy(&instruction);
            if matches!(instruction, Instruction::Tag { .. } | Instruction::Push { .. }) {
                tagged = true;
            }

            if !committed && matches!(policy, CommitPolicy::Before | CommitPolicy::Around) {
                commands.push(Box::new(CommitCommand));
                committed = true;
            }

            commands.push(new_command(instruction));

            match policy {
                CommitPolicy::Around => {
                    commands.push(Box::new(CommitCommand));
                    committed = true;
                }
                CommitPolicy::Defer => committed = false,
                CommitPolicy::Before | CommitPolicy::Never => {}
            }

            let is_last = i + 1 == total;
            let stage_ends = is_last
                || matches!(iter.peek(), Some((_, Instruction::From { .. })));
            if stage_ends {
                if !committed {
                    commands.push(Box::new(CommitCommand));
                    committed = true;
                }
                if !is_last || final_cleanup {
                    commands.push(Box::new(CleanupCommand {
                        is_final: is_last,
                        tagged,
                    }));
                }
                tagged = false;
            }
        }

        Plan { commands }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Command> {
        self.commands.get(index).map(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Box<dyn Command>> {
        self.commands.get_mut(index)
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    /// Insert `sub` directly after `index`, ahead of the remaining steps.
    pub fn splice_after(&mut self, index: usize, sub: Plan) {
        let at = (index + 1).min(self.commands.len());
        self.commands.splice(at..at, sub.commands);
    }

    /// Display form of every step, in order.
    pub fn describe(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.to_string()).collect()
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.describe()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::kilnfile::Kilnfile;

    fn plan(src: &str, final_cleanup: bool) -> Vec<String> {
        let kilnfile = Kilnfile::parse(src).unwrap();
        Plan::new(kilnfile.instructions, final_cleanup).describe()
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_env() {
        let vars = env(&[("HOME", "/root"), ("NAME", "kiln")]);
        assert_eq!(expand_env("$HOME/bin", &vars), "/root/bin");
        assert_eq!(expand_env("${NAME}-1", &vars), "kiln-1");
        assert_eq!(expand_env("$MISSING/x", &vars), "/x");
        assert_eq!(expand_env("cost \\$5", &vars), "cost $5");
        assert_eq!(expand_env("50$", &vars), "50$");
        assert_eq!(expand_env("${OPEN", &vars), "${OPEN");
    }

    #[test]
    fn test_commit_after_run() {
        let steps = plan("FROM alpine\nRUN make\n", true);
        assert_eq!(steps, vec!["FROM alpine", "RUN make", "COMMIT", "CLEANUP"]);
    }

    #[test]
    fn test_config_commands_share_one_commit() {
        let steps = plan("FROM alpine\nENV A=1\nLABEL x=y\nRUN make\nCMD [\"app\"]\n", true);
        assert_eq!(
            steps,
            vec![
                "FROM alpine",
                "ENV A=1",
                "LABEL x=y",
                "COMMIT",
                "RUN make",
                "COMMIT",
                "CMD [\"app\"]",
                "COMMIT",
                "CLEANUP",
            ]
        );
    }

    #[test]
    fn test_tag_flushes_pending_changes() {
        let steps = plan("FROM alpine\nENV A=1\nTAG app:1\nPUSH app:1\n", false);
        assert_eq!(steps, vec!["FROM alpine", "ENV A=1", "COMMIT", "TAG app:1", "PUSH app:1"]);
    }

    #[test]
    fn test_stage_boundary_cleanup() {
        let steps = plan("FROM alpine\nRUN make\nEXPORT /out\nFROM debian\nIMPORT /out\n", true);
        assert_eq!(
            steps,
            vec![
                "FROM alpine",
                "RUN make",
                "COMMIT",
                "EXPORT /out /",
                "COMMIT",
                "CLEANUP",
                "FROM debian",
                "IMPORT /out ./",
                "COMMIT",
                "CLEANUP",
            ]
        );
    }

    #[test]
    fn test_no_final_cleanup_for_sub_plans() {
        let steps = plan("FROM alpine\nENV A=1\n", false);
        assert_eq!(steps, vec!["FROM alpine", "ENV A=1", "COMMIT"]);
    }

    #[test]
    fn test_splice_after() {
        let mut main = Plan::new(Kilnfile::parse("FROM a\nTAG x\nTAG y\n").unwrap().instructions, false);
        let sub = Plan::new(
            vec![Instruction::Tag { name: "injected".to_string() }],
            false,
        );
        main.splice_after(0, sub);
        assert_eq!(main.describe(), vec!["FROM a", "TAG injected", "TAG x", "TAG y"]);

        let tail = Plan::new(vec![Instruction::Tag { name: "last".to_string() }], false);
        let len = main.len();
        main.splice_after(len - 1, tail);
        assert_eq!(main.get(main.len() - 1).unwrap().to_string(), "TAG last");
    }
}
