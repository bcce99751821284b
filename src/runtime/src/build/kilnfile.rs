//! Kilnfile parser.
//!
//! Parses a Kilnfile into a sequence of build instructions.
//! Supports line continuations (`\`), comments, shell and JSON (exec) forms
//! for RUN/CMD/ENTRYPOINT/ATTACH, and quoted `KEY=VALUE` pairs for ENV and
//! LABEL.

use kiln_core::error::{KilnError, Result};
use std::fmt;

/// A single Kilnfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM <image>`
    From { image: String },
    /// `MAINTAINER <name>`
    Maintainer { name: String },
    /// `RUN <command>`
    Run { cmd: Vec<String> },
    /// `ATTACH [command]`
    Attach { cmd: Vec<String> },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { pairs: Vec<(String, String)> },
    /// `LABEL <key>=<value> ...`
    Label { pairs: Vec<(String, String)> },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `VOLUME <path> ...`
    Volume { paths: Vec<String> },
    /// `CMD <command>`
    Cmd { cmd: Vec<String> },
    /// `ENTRYPOINT <command>`
    Entrypoint { cmd: Vec<String> },
    /// `ONBUILD <instruction>`
    Onbuild { trigger: String },
    /// `COPY <src>... <dest>`
    Copy { src: Vec<String>, dest: String },
    /// `ADD <src>... <dest>`
    Add { src: Vec<String>, dest: String },
    /// `MOUNT <host>:<container>` or `MOUNT <container path>`
    Mount { specs: Vec<String> },
    /// `EXPORT <src>... [dest]`
    Export { src: Vec<String>, dest: String },
    /// `IMPORT <src>... [dest]`
    Import { src: Vec<String>, dest: String },
    /// `TAG <name>`
    Tag { name: String },
    /// `PUSH <name>`
    Push { name: String },
}

impl Instruction {
    /// Upper-case keyword of the instruction.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Maintainer { .. } => "MAINTAINER",
            Instruction::Run { .. } => "RUN",
            Instruction::Attach { .. } => "ATTACH",
            Instruction::Env { .. } => "ENV",
            Instruction::Label { .. } => "LABEL",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Onbuild { .. } => "ONBUILD",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Mount { .. } => "MOUNT",
            Instruction::Export { .. } => "EXPORT",
            Instruction::Import { .. } => "IMPORT",
            Instruction::Tag { .. } => "TAG",
            Instruction::Push { .. } => "PUSH",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = self.keyword();
        match self {
            Instruction::From { image } => write!(f, "{} {}", kw, image),
            Instruction::Maintainer { name } => write!(f, "{} {}", kw, name),
            Instruction::Run { cmd }
            | Instruction::Attach { cmd }
            | Instruction::Cmd { cmd }
            | Instruction::Entrypoint { cmd } => write!(f, "{} {}", kw, display_command(cmd)),
            Instruction::Env { pairs } | Instruction::Label { pairs } => {
                let pairs: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{} {}", kw, pairs.join(" "))
            }
            Instruction::Workdir { path } => write!(f, "{} {}", kw, path),
            Instruction::User { user } => write!(f, "{} {}", kw, user),
            Instruction::Expose { ports } => write!(f, "{} {}", kw, ports.join(" ")),
            Instruction::Volume { paths } => write!(f, "{} {}", kw, paths.join(" ")),
            Instruction::Onbuild { trigger } => write!(f, "{} {}", kw, trigger),
            Instruction::Copy { src, dest }
            | Instruction::Add { src, dest }
            | Instruction::Export { src, dest }
            | Instruction::Import { src, dest } => write!(f, "{} {} {}", kw, src.join(" "), dest),
            Instruction::Mount { specs } => write!(f, "{} {}", kw, specs.join(" ")),
            Instruction::Tag { name } | Instruction::Push { name } => write!(f, "{} {}", kw, name),
        }
    }
}

/// Show `sh -c` commands the way they were written.
pub fn display_command(cmd: &[String]) -> String {
    match cmd {
        [sh, c, script] if sh == "/bin/sh" && c == "-c" => script.clone(),
        _ => serde_json::to_string(cmd).unwrap_or_else(|_| cmd.join(" ")),
    }
}

/// Parsed Kilnfile: a list of instructions in order.
#[derive(Debug, Clone)]
pub struct Kilnfile {
    pub instructions: Vec<Instruction>,
}

impl Kilnfile {
    /// Parse a Kilnfile from its (already rendered) text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();
        let mut first_line = None;

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            first_line.get_or_insert(line_num);
            instructions.push(parse_instruction(trimmed, line_num)?);
        }

        match instructions.first() {
            None => Err(KilnError::ParseError {
                line: 1,
                message: "Kilnfile is empty or contains no instructions".to_string(),
            }),
            Some(Instruction::From { .. }) => Ok(Kilnfile { instructions }),
            Some(other) => Err(KilnError::ParseError {
                line: first_line.unwrap_or(1),
                message: format!("first instruction must be FROM, found {}", other.keyword()),
            }),
        }
    }

    /// Parse a Kilnfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::ConfigError(format!(
                "Failed to read Kilnfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Parse ONBUILD triggers found on a base image.
///
/// FROM, MAINTAINER and nested ONBUILD are not allowed as triggers.
pub fn parse_onbuild_commands(triggers: &[String]) -> Result<Vec<Instruction>> {
    triggers
        .iter()
        .enumerate()
        .map(|(i, trigger)| {
            let instruction = parse_instruction(trigger.trim(), i + 1)?;
            check_trigger(&instruction).map_err(KilnError::PlanError)?;
            Ok(instruction)
        })
        .collect()
}

fn check_trigger(instruction: &Instruction) -> std::result::Result<(), String> {
    match instruction {
        Instruction::From { .. } | Instruction::Maintainer { .. } | Instruction::Onbuild { .. } => {
            Err(format!(
                "{} isn't allowed as an ONBUILD trigger",
                instruction.keyword()
            ))
        }
        _ => Ok(()),
    }
}

/// Join lines ending with `\` into logical lines, keeping the line number
/// each logical line starts on.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 1;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comments inside a continued instruction are dropped
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                let head = if current.is_empty() { head } else { head.trim_start() };
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(if current.is_empty() { line } else { line.trim_start() });
                logical_lines.push((start, std::mem::take(&mut current)));
            }
        }
    }

    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

fn parse_error(line: usize, message: impl Into<String>) -> KilnError {
    KilnError::ParseError {
        line,
        message: message.into(),
    }
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    if rest.is_empty() && keyword_upper != "ATTACH" {
        return Err(parse_error(
            line_num,
            format!("{} requires an argument", keyword_upper),
        ));
    }

    let instruction = match keyword_upper.as_str() {
        "FROM" => Instruction::From {
            image: single_word(rest, "FROM", line_num)?,
        },
        "MAINTAINER" => Instruction::Maintainer {
            name: rest.to_string(),
        },
        "RUN" => Instruction::Run {
            cmd: command_form(rest, line_num)?,
        },
        "ATTACH" => Instruction::Attach {
            cmd: if rest.is_empty() {
                Vec::new()
            } else {
                command_form(rest, line_num)?
            },
        },
        "CMD" => Instruction::Cmd {
            cmd: command_form(rest, line_num)?,
        },
        "ENTRYPOINT" => Instruction::Entrypoint {
            cmd: command_form(rest, line_num)?,
        },
        "ENV" => Instruction::Env {
            pairs: parse_pairs(rest, "ENV", line_num)?,
        },
        "LABEL" => Instruction::Label {
            pairs: parse_pairs(rest, "LABEL", line_num)?,
        },
        "WORKDIR" => Instruction::Workdir {
            path: unquote(rest),
        },
        "USER" => Instruction::User {
            user: single_word(rest, "USER", line_num)?,
        },
        "EXPOSE" => Instruction::Expose {
            ports: shell_split(rest, line_num)?
                .into_iter()
                .map(|p| if p.contains('/') { p } else { format!("{}/tcp", p) })
                .collect(),
        },
        "VOLUME" => Instruction::Volume {
            paths: list_form(rest, line_num)?,
        },
        "ONBUILD" => {
            let inner = parse_instruction(rest, line_num)?;
            check_trigger(&inner).map_err(|message| parse_error(line_num, message))?;
            Instruction::Onbuild {
                trigger: rest.to_string(),
            }
        }
        "COPY" | "ADD" => {
            let mut args = list_form(rest, line_num)?;
            if args.len() < 2 {
                return Err(parse_error(
                    line_num,
                    format!(
                        "{} requires at least one source and a destination",
                        keyword_upper
                    ),
                ));
            }
            let dest = args.pop().unwrap_or_default();
            if keyword_upper == "COPY" {
                Instruction::Copy { src: args, dest }
            } else {
                Instruction::Add { src: args, dest }
            }
        }
        "MOUNT" => Instruction::Mount {
            specs: list_form(rest, line_num)?,
        },
        "EXPORT" | "IMPORT" => {
            let mut args = list_form(rest, line_num)?;
            let dest = if args.len() > 1 {
                args.pop().unwrap_or_default()
            } else if keyword_upper == "EXPORT" {
                "/".to_string()
            } else {
                "./".to_string()
            };
            if keyword_upper == "EXPORT" {
                Instruction::Export { src: args, dest }
            } else {
                Instruction::Import { src: args, dest }
            }
        }
        "TAG" => Instruction::Tag {
            name: single_word(rest, "TAG", line_num)?,
        },
        "PUSH" => Instruction::Push {
            name: single_word(rest, "PUSH", line_num)?,
        },
        _ => {
            return Err(parse_error(
                line_num,
                format!("unknown instruction '{}'", keyword),
            ))
        }
    };

    Ok(instruction)
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn single_word(rest: &str, keyword: &str, line_num: usize) -> Result<String> {
    let words = shell_split(rest, line_num)?;
    match words.as_slice() {
        [word] => Ok(word.clone()),
        _ => Err(parse_error(
            line_num,
            format!("{} takes exactly one argument", keyword),
        )),
    }
}

/// JSON exec form, or shell form wrapped in `/bin/sh -c`.
fn command_form(rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.starts_with('[') {
        return parse_json_array(rest, line_num);
    }
    Ok(vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()])
}

/// JSON array, or whitespace separated words.
fn list_form(rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.starts_with('[') {
        return parse_json_array(rest, line_num);
    }
    shell_split(rest, line_num)
}

/// `KEY=VALUE ...` pairs, or the legacy `KEY VALUE` form.
fn parse_pairs(rest: &str, keyword: &str, line_num: usize) -> Result<Vec<(String, String)>> {
    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        if remainder.is_empty() {
            return Err(parse_error(
                line_num,
                format!("{} requires a value for '{}'", keyword, first),
            ));
        }
        return Ok(vec![(first.to_string(), unquote(remainder))]);
    }

    shell_split(rest, line_num)?
        .into_iter()
        .map(|word| {
            let (key, value) = word.split_once('=').ok_or_else(|| {
                parse_error(
                    line_num,
                    format!("{} expects KEY=VALUE pairs, got '{}'", keyword, word),
                )
            })?;
            if key.is_empty() {
                return Err(parse_error(line_num, format!("{} has an empty key", keyword)));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| parse_error(line_num, format!("invalid JSON array '{}': {}", s, e)))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Split into words the way a POSIX shell would, without expansion.
fn shell_split(s: &str, line_num: usize) -> Result<Vec<String>> {
    shell_words::split(s).map_err(|e| parse_error(line_num, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    // --- join_continuation_lines ---

    #[test]
    fn test_join_continuation_keeps_start_line() {
        let input = "FROM alpine\nRUN apk update && \\\n    apk add curl\nRUN true";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].0, 2);
        assert!(lines[1].1.contains("apk add curl"));
        assert_eq!(lines[2].0, 4);
    }

    #[test]
    fn test_join_continuation_skips_inner_comments() {
        let input = "RUN a \\\n# explain b\n    b";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].1.contains("explain"));
    }

    // --- instructions ---

    #[test]
    fn test_parse_run_shell_and_exec() {
        assert_eq!(
            parse_instruction("RUN make all", 1).unwrap(),
            Instruction::Run { cmd: sh("make all") }
        );
        assert_eq!(
            parse_instruction(r#"run ["echo", "hi"]"#, 1).unwrap(),
            Instruction::Run {
                cmd: vec!["echo".to_string(), "hi".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_attach_without_command() {
        assert_eq!(
            parse_instruction("ATTACH", 1).unwrap(),
            Instruction::Attach { cmd: Vec::new() }
        );
    }

    #[test]
    fn test_parse_env_pairs() {
        let inst = parse_instruction(r#"ENV A=1 B="two words" C='x y'"#, 1).unwrap();
        assert_eq!(
            inst,
            Instruction::Env {
                pairs: vec![
                    ("A".to_string(), "1".to_string()),
                    ("B".to_string(), "two words".to_string()),
                    ("C".to_string(), "x y".to_string()),
                ]
            }
        );
    }

    #[test]
    fn test_parse_env_legacy() {
        let inst = parse_instruction("ENV PATH /usr/local/bin:/usr/bin", 1).unwrap();
        assert_eq!(
            inst,
            Instruction::Env {
                pairs: vec![("PATH".to_string(), "/usr/local/bin:/usr/bin".to_string())]
            }
        );
    }

    #[test]
    fn test_parse_env_missing_value() {
        assert!(parse_instruction("ENV ONLYKEY", 3).is_err());
    }

    #[test]
    fn test_parse_copy() {
        assert_eq!(
            parse_instruction("COPY a.txt b/ /app/", 1).unwrap(),
            Instruction::Copy {
                src: vec!["a.txt".to_string(), "b/".to_string()],
                dest: "/app/".to_string(),
            }
        );
        assert!(parse_instruction("COPY only", 1).is_err());
    }

    #[test]
    fn test_parse_export_import_defaults() {
        assert_eq!(
            parse_instruction("EXPORT /app/bin", 1).unwrap(),
            Instruction::Export {
                src: vec!["/app/bin".to_string()],
                dest: "/".to_string(),
            }
        );
        assert_eq!(
            parse_instruction("IMPORT bin /usr/local/", 1).unwrap(),
            Instruction::Import {
                src: vec!["bin".to_string()],
                dest: "/usr/local/".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_expose_adds_protocol() {
        assert_eq!(
            parse_instruction("EXPOSE 80 53/udp", 1).unwrap(),
            Instruction::Expose {
                ports: vec!["80/tcp".to_string(), "53/udp".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_onbuild_rejects_from() {
        let err = parse_instruction("ONBUILD FROM alpine", 7).unwrap_err();
        assert!(matches!(err, KilnError::ParseError { line: 7, .. }));
        assert_eq!(
            parse_instruction("ONBUILD RUN make", 1).unwrap(),
            Instruction::Onbuild {
                trigger: "RUN make".to_string()
            }
        );
    }

    #[test]
    fn test_parse_tag_single_word() {
        assert!(parse_instruction("TAG app:1 extra", 1).is_err());
        assert_eq!(
            parse_instruction("TAG app:1", 1).unwrap(),
            Instruction::Tag {
                name: "app:1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_instruction() {
        let err = parse_instruction("FORM alpine", 5).unwrap_err();
        assert_eq!(err.to_string(), "Parse error at line 5: unknown instruction 'FORM'");
    }

    #[test]
    fn test_shell_split_quotes_and_escapes() {
        let words = shell_split(r#"a "b c" 'd e' f\ g"#, 1).unwrap();
        assert_eq!(words, vec!["a", "b c", "d e", "f g"]);
        let err = shell_split(r#"a "b"#, 7).unwrap_err();
        assert!(matches!(err, KilnError::ParseError { line: 7, .. }));
    }

    // --- Kilnfile ---

    #[test]
    fn test_parse_kilnfile() {
        let content = "\
# build the app
FROM golang:1.21

ENV CGO_ENABLED=0
COPY . /src
RUN cd /src && \\
    go build -o /bin/app
TAG app:latest
";
        let kilnfile = Kilnfile::parse(content).unwrap();
        assert_eq!(kilnfile.instructions.len(), 5);
        assert_eq!(kilnfile.instructions[0].keyword(), "FROM");
        assert_eq!(
            kilnfile.instructions[3],
            Instruction::Run {
                cmd: sh("cd /src && go build -o /bin/app")
            }
        );
    }

    #[test]
    fn test_parse_kilnfile_requires_from() {
        let err = Kilnfile::parse("\n\nRUN true").unwrap_err();
        assert!(matches!(err, KilnError::ParseError { line: 3, .. }));
        assert!(Kilnfile::parse("# nothing").is_err());
    }

    #[test]
    fn test_parse_onbuild_commands() {
        let parsed = parse_onbuild_commands(&[
            "RUN make".to_string(),
            "COPY . /src".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed.len(), 2);

        let err = parse_onbuild_commands(&["MAINTAINER me".to_string()]).unwrap_err();
        assert!(matches!(err, KilnError::PlanError(_)));
    }

    #[test]
    fn test_display_roundtrips_shell_form() {
        let inst = parse_instruction("RUN echo hi", 1).unwrap();
        assert_eq!(inst.to_string(), "RUN echo hi");
        let inst = parse_instruction(r#"CMD ["nginx", "-g"]"#, 1).unwrap();
        assert_eq!(inst.to_string(), r#"CMD ["nginx","-g"]"#);
    }
}
