// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! The skeleton bank: a lazy parse cache over the skeleton file tree,
//! keyed by `(instrument, mode, command name)`, plus the task factory
//! that turns bank entries into dispatchable abstract commands.
//!
//! The directory layout mirrors the observatory convention:
//! `<base>/<OBE_ID>/sk/<OBE_MODE>/<command>.sk`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::ast::{Ast, AstKind};
use crate::error::{attach_context, ErrorRecord, ExecError, RunError};
use crate::eval::{Evaluator, ParamMap, Value};
use crate::grammar::{self, skeleton::parse_sk_commands};
use crate::interp::task::ExecContext;
use crate::interp::Interpreter;
use crate::ope::{self, OpeError};
use crate::service::{CommandTask, RegistryMap, TaskFactory};

/// A parsed skeleton file and its harvested metadata.
#[derive(Debug)]
pub struct SkBundle {
    pub obe_id: String,
    pub obe_mode: String,
    pub name: String,
    /// Header block, leniently harvested; parse trouble here is
    /// ignored because nothing critical lives in it.
    pub header: IndexMap<String, String>,
    /// Raw default parameter text, keyed by upper-cased name.
    pub params: IndexMap<String, String>,
    /// `*pattern` lines from the parameter block.
    pub patterns: IndexMap<String, Vec<String>>,
    /// `skeleton(param_list, command_section)`
    pub ast: Ast,
    pub errors: Vec<ErrorRecord>,
    pub filepath: PathBuf,
}

impl SkBundle {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The default-parameter `param_list` of the skeleton.
    pub fn default_params(&self) -> Result<&Ast, RunError> {
        Ok(self.ast.node(0)?)
    }

    /// The `command_section` body of the skeleton.
    pub fn body(&self) -> Result<&Ast, RunError> {
        Ok(self.ast.node(1)?)
    }
}

/// Harvests `NAME=value` lines from a skeleton header or parameter
/// block: `#` comments and blank lines are skipped, `\` continues a
/// line, `*name=` lines collect into the pattern table.
pub fn collect_params(
    buf: &str,
) -> (
    IndexMap<String, String>,
    Vec<String>,
    IndexMap<String, Vec<String>>,
) {
    let mut params = IndexMap::new();
    let mut param_lst = Vec::new();
    let mut patterns = IndexMap::new();

    let mut lines: Vec<&str> = buf.lines().collect();
    lines.reverse();

    while let Some(line) = lines.pop() {
        let mut line = line.trim().to_owned();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        while line.ends_with('\\') {
            line.pop();
            match lines.pop() {
                Some(next) => line.push_str(next.trim()),
                None => break,
            }
        }

        if let Some(idx) = line.find('=') {
            let var = line[..idx].trim().to_uppercase();
            let val = line[idx + 1..].trim().to_owned();
            if let Some(pattern) = var.strip_prefix('*') {
                patterns.insert(
                    pattern.to_owned(),
                    val.split(',').map(|s| s.trim().to_owned()).collect(),
                );
            } else {
                param_lst.push(format!("{var}={val}"));
                params.insert(var, val);
            }
        }
    }

    (params, param_lst, patterns)
}

/// Parses a whole skeleton buffer: sections are split, the header and
/// parameter blocks harvested, the defaults parsed with the shared
/// parameter grammar and the command part with the skeleton grammar.
/// Scan and parse errors accumulate in the returned bundle.
pub fn parse_skeleton_buf(buf: &str) -> Result<(Ast, SkeletonMeta), OpeError> {
    let sections = ope::get_sections(buf)?;

    let (header, _, _) = collect_params(&sections.header);
    let (params, param_lst, patterns) = collect_params(&sections.params);

    let mut errors = Vec::new();

    let parambuf = param_lst.join(" ");
    let params_parse = grammar::parse_params(&parambuf);
    let mut param_errors = params_parse.errors;
    attach_context(&parambuf, &mut param_errors, 1);
    errors.extend(param_errors);

    let cmd_parse = parse_sk_commands(&sections.commands, sections.command_line);
    let mut cmd_errors = cmd_parse.errors;
    attach_context(buf, &mut cmd_errors, 10);
    errors.extend(cmd_errors);

    let mut skeleton = Ast::new(AstKind::Skeleton);
    skeleton.append(params_parse.ast);
    skeleton.append(cmd_parse.ast);

    Ok((
        skeleton,
        SkeletonMeta {
            header,
            params,
            patterns,
            errors,
        },
    ))
}

/// Metadata harvested alongside a skeleton parse.
#[derive(Debug, Default)]
pub struct SkeletonMeta {
    pub header: IndexMap<String, String>,
    pub params: IndexMap<String, String>,
    pub patterns: IndexMap<String, Vec<String>>,
    pub errors: Vec<ErrorRecord>,
}

type BankKey = (String, String, String);

/// Lazy cache of parsed skeleton bundles.
pub struct SkBank {
    base: PathBuf,
    cache: RwLock<HashMap<BankKey, Arc<SkBundle>>>,
}

impl SkBank {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn sk_path(&self, obe_id: &str, obe_mode: &str, cmdname: &str) -> PathBuf {
        self.base
            .join(obe_id.to_uppercase())
            .join("sk")
            .join(obe_mode.to_uppercase())
            .join(format!("{}.sk", cmdname.to_lowercase()))
    }

    /// Returns the (possibly cached) bundle for an abstract command.
    /// Bundles with parse errors are cached too; re-parsing cannot fix
    /// them and the dispatch path reports them.
    pub fn lookup(
        &self,
        obe_id: &str,
        obe_mode: &str,
        cmdname: &str,
    ) -> Result<Arc<SkBundle>, ExecError> {
        let key = (
            obe_id.to_uppercase(),
            obe_mode.to_uppercase(),
            cmdname.to_lowercase(),
        );
        if let Some(bundle) = self.cache.read().get(&key) {
            return Ok(Arc::clone(bundle));
        }

        let path = self.sk_path(obe_id, obe_mode, cmdname);
        debug!(path = %path.display(), "loading skeleton file");
        let buf = fs::read_to_string(&path).map_err(|e| ExecError::Failed {
            cmd: cmdname.to_owned(),
            detail: format!("cannot read '{}': {e}", path.display()),
        })?;

        let (ast, meta) = parse_skeleton_buf(&buf).map_err(|e| ExecError::Failed {
            cmd: cmdname.to_owned(),
            detail: e.to_string(),
        })?;

        let bundle = Arc::new(SkBundle {
            obe_id: key.0.clone(),
            obe_mode: key.1.clone(),
            name: key.2.clone(),
            header: meta.header,
            params: meta.params,
            patterns: meta.patterns,
            ast,
            errors: meta.errors,
            filepath: path,
        });
        self.cache.write().insert(key, Arc::clone(&bundle));
        Ok(bundle)
    }

    /// Instrument modes available under the bank's base directory.
    pub fn modes(&self, obe_id: &str) -> Vec<String> {
        let dir = self.base.join(obe_id.to_uppercase()).join("sk");
        read_dir_names(&dir, |entry| entry.path().is_dir())
    }

    /// Abstract command names available for an instrument mode.
    pub fn commands(&self, obe_id: &str, obe_mode: &str) -> Vec<String> {
        let dir = self
            .base
            .join(obe_id.to_uppercase())
            .join("sk")
            .join(obe_mode.to_uppercase());
        let mut names: Vec<String> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|entry| {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("sk") {
                        path.file_stem()
                            .and_then(|s| s.to_str())
                            .map(str::to_owned)
                    } else {
                        None
                    }
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

fn read_dir_names(dir: &Path, keep: impl Fn(&fs::DirEntry) -> bool) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|entry| keep(entry))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Task factory adapting one bank entry to the task-manager contract;
/// instantiation runs the skeleton as a nested interpreter invocation.
pub struct SkCommandFactory {
    bank: Arc<SkBank>,
    obe_id: String,
    obe_mode: String,
    cmdname: String,
}

impl SkCommandFactory {
    pub fn new(bank: Arc<SkBank>, obe_id: &str, obe_mode: &str, cmdname: &str) -> Self {
        Self {
            bank,
            obe_id: obe_id.to_owned(),
            obe_mode: obe_mode.to_owned(),
            cmdname: cmdname.to_owned(),
        }
    }
}

impl TaskFactory for SkCommandFactory {
    fn instantiate(&self, params: ParamMap) -> Result<Box<dyn CommandTask>, ExecError> {
        let bundle = self
            .bank
            .lookup(&self.obe_id, &self.obe_mode, &self.cmdname)?;

        if !bundle.ok() {
            let verbose = bundle
                .errors
                .first()
                .map(|e| e.verbose.clone().unwrap_or_else(|| e.to_string()))
                .unwrap_or_default();
            return Err(ExecError::Failed {
                cmd: self.cmdname.clone(),
                detail: format!(
                    "{} error(s) parsing referent skeleton file '{}':\n{}",
                    bundle.errors.len(),
                    bundle.filepath.display(),
                    verbose
                ),
            });
        }

        Ok(Box::new(SkTask {
            bundle,
            params: Some(params),
        }))
    }
}

struct SkTask {
    bundle: Arc<SkBundle>,
    params: Option<ParamMap>,
}

impl CommandTask for SkTask {
    fn run(&mut self, ctx: &ExecContext) -> Result<Value, RunError> {
        let params = self.params.take().unwrap_or_default();

        let mut eval = Evaluator::new(Arc::clone(&ctx.status), Arc::clone(&ctx.frames));
        eval.set_params(self.bundle.default_params()?, true)?;
        eval.set_vars(params, true)?;

        ctx.publish(
            "skfile",
            &format!(
                "{} ({}/{})",
                self.bundle.name, self.bundle.obe_id, self.bundle.obe_mode
            ),
        );

        let interp = Interpreter::new(ctx.clone());
        interp.run(self.bundle.body()?, &mut eval)
    }
}

/// Registers every abstract command found under the bank's directory
/// tree for the given instruments; the subsystem name for each is
/// `<OBE_ID>_<OBE_MODE>`.
pub fn register_abstract_commands(registry: &RegistryMap, bank: &Arc<SkBank>, obe_ids: &[&str]) {
    for obe_id in obe_ids {
        for obe_mode in bank.modes(obe_id) {
            let subsys = format!("{}_{}", obe_id.to_uppercase(), obe_mode.to_uppercase());
            for cmdname in bank.commands(obe_id, &obe_mode) {
                let factory = SkCommandFactory::new(Arc::clone(bank), obe_id, &obe_mode, &cmdname);
                registry.register(&cmdname, &subsys, Arc::new(factory));
            }
        }
    }
}
