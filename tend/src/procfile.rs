//! Procfile parser.
//!
//! A procfile is a sequence of task blocks separated by blank lines. Every
//! line of a block is `directive value`:
//!
//! ```text
//! # web frontend
//! name    web
//! need    mkdir -p /srv/www/cache
//! command python3 -m http.server 8080 \
//!         --bind 127.0.0.1
//! dir     /srv/www
//! user    www-data
//! env     PYTHONUNBUFFERED=1
//! ```
//!
//! `name` and `command` are required. `dir`, `chroot`, `user` and `group`
//! may appear at most once; `need` and `env` may repeat. Users and groups
//! are resolved against the host here, so a bad identity never reaches the
//! daemon.

use crate::error::SpecError;
use crate::spec::TaskSpec;
use nix::unistd::{Group, User};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

const DEFAULT_FILE_NAME: &str = "Procfile";

/// Resolve a `-f` argument to the procfile path. Directories (or anything
/// ending in `/`) mean `<dir>/Procfile`.
pub fn resolve_path(input: &Path) -> PathBuf {
    if input.as_os_str().to_string_lossy().ends_with('/') || input.is_dir() {
        input.join(DEFAULT_FILE_NAME)
    } else {
        input.to_path_buf()
    }
}

/// Read and parse a procfile.
pub fn parse_file(path: &Path) -> Result<Vec<TaskSpec>, SpecError> {
    let file = std::fs::File::open(path)?;
    parse_reader(file)
}

pub fn parse_reader<R: Read>(mut reader: R) -> Result<Vec<TaskSpec>, SpecError> {
    let mut input = String::new();
    reader.read_to_string(&mut input)?;
    parse(&input)
}

/// Parse procfile text into task specifications, in block order.
pub fn parse(input: &str) -> Result<Vec<TaskSpec>, SpecError> {
    let mut tasks = Vec::new();
    let mut names = HashSet::new();
    let mut block = Block::default();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if pending.is_none() && line.starts_with('#') {
            continue;
        }

        if let Some(body) = line.strip_suffix('\\') {
            let (_, acc) = pending.get_or_insert_with(|| (line_no, String::new()));
            push_joined(acc, body.trim_end());
            continue;
        }

        let (start, logical) = match pending.take() {
            Some((start, mut acc)) => {
                push_joined(&mut acc, line);
                (start, acc)
            }
            None => (line_no, line.to_string()),
        };

        if logical.is_empty() {
            finish_block(std::mem::take(&mut block), &mut names, &mut tasks)?;
            continue;
        }

        block.apply(start, &logical)?;
    }

    if let Some((start, logical)) = pending.take() {
        if !logical.is_empty() {
            block.apply(start, &logical)?;
        }
    }
    finish_block(block, &mut names, &mut tasks)?;

    Ok(tasks)
}

fn push_joined(acc: &mut String, piece: &str) {
    if piece.is_empty() {
        return;
    }
    if !acc.is_empty() {
        acc.push(' ');
    }
    acc.push_str(piece);
}

fn finish_block(
    block: Block,
    names: &mut HashSet<String>,
    tasks: &mut Vec<TaskSpec>,
) -> Result<(), SpecError> {
    let Some(start) = block.start else {
        return Ok(());
    };

    let name = block.name.ok_or_else(|| SpecError::MissingDirective {
        line: start,
        directive: "name".to_string(),
    })?;
    let command = block.command.ok_or_else(|| SpecError::MissingDirective {
        line: start,
        directive: "command".to_string(),
    })?;

    if !names.insert(name.clone()) {
        return Err(SpecError::DuplicateTask { line: start, name });
    }

    tasks.push(TaskSpec {
        name,
        command,
        setup: block.setup,
        dir: block.dir,
        chroot: block.chroot,
        user: block.user,
        group: block.group,
        env: block.env,
    });
    Ok(())
}

/// Directives collected for the task block being parsed.
#[derive(Default)]
struct Block {
    /// Line of the first directive; `None` while the block is empty.
    start: Option<usize>,
    name: Option<String>,
    command: Option<Vec<String>>,
    setup: Vec<Vec<String>>,
    dir: Option<PathBuf>,
    chroot: Option<PathBuf>,
    user: Option<String>,
    group: Option<String>,
    env: Vec<String>,
}

impl Block {
    fn apply(&mut self, line: usize, text: &str) -> Result<(), SpecError> {
        let (directive, value) = match text.split_once(char::is_whitespace) {
            Some((directive, value)) => (directive, value.trim()),
            None => (text, ""),
        };

        if value.is_empty() {
            return Err(SpecError::MissingValue {
                line,
                directive: directive.to_string(),
            });
        }

        self.start.get_or_insert(line);

        match directive {
            "name" => set_once(&mut self.name, value.to_string(), line, directive),
            "command" => {
                let argv = split_words(line, directive, value)?;
                set_once(&mut self.command, argv, line, directive)
            }
            "need" => {
                let argv = split_words(line, directive, value)?;
                self.setup.push(argv);
                Ok(())
            }
            "env" => {
                match value.split_once('=') {
                    Some((key, _)) if !key.is_empty() => {}
                    _ => {
                        return Err(SpecError::MalformedEnv {
                            line,
                            entry: value.to_string(),
                        });
                    }
                }
                self.env.push(value.to_string());
                Ok(())
            }
            "dir" => {
                let path = absolute_path(line, directive, value)?;
                set_once(&mut self.dir, path, line, directive)
            }
            "chroot" => {
                let path = absolute_path(line, directive, value)?;
                set_once(&mut self.chroot, path, line, directive)
            }
            "user" => {
                if !matches!(User::from_name(value), Ok(Some(_))) {
                    return Err(SpecError::UnknownUser {
                        line,
                        name: value.to_string(),
                    });
                }
                set_once(&mut self.user, value.to_string(), line, directive)
            }
            "group" => {
                if !matches!(Group::from_name(value), Ok(Some(_))) {
                    return Err(SpecError::UnknownGroup {
                        line,
                        name: value.to_string(),
                    });
                }
                set_once(&mut self.group, value.to_string(), line, directive)
            }
            other => Err(SpecError::UnknownDirective {
                line,
                directive: other.to_string(),
            }),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, line: usize, directive: &str) -> Result<(), SpecError> {
    if slot.is_some() {
        return Err(SpecError::DuplicateDirective {
            line,
            directive: directive.to_string(),
        });
    }
    *slot = Some(value);
    Ok(())
}

fn split_words(line: usize, directive: &str, value: &str) -> Result<Vec<String>, SpecError> {
    let argv = shlex::split(value).ok_or_else(|| SpecError::UnbalancedQuotes {
        line,
        value: value.to_string(),
    })?;
    if argv.is_empty() {
        return Err(SpecError::MissingValue {
            line,
            directive: directive.to_string(),
        });
    }
    Ok(argv)
}

fn absolute_path(line: usize, directive: &str, value: &str) -> Result<PathBuf, SpecError> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(SpecError::RelativePath {
            line,
            directive: directive.to_string(),
            path,
        });
    }
    Ok(path)
}
