// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Text-level handling of OPE (observation procedure) and skeleton
//! files: section splitting, parameter-block harvesting with `*LOAD`
//! includes, and the `$var` substitution used for ad-hoc command
//! extraction.
//!
//! Everything here works on raw text; the result feeds the parsers.
//! The interpreter must never see unresolved `$name` text, so
//! [`substitute_params`] refuses to return a command that still
//! contains one.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // old style: <Header>…</Header> <Parameter_List>…</Parameter_List>
    //            <Command>…</Command>
    static ref SECTIONS_OLD: Regex = Regex::new(
        r"(?is)^.*<HEADER>(?P<hdr>.*)</HEADER>\s*<PARAMETER_LIST>(?P<params>.*)</PARAMETER_LIST>\s*<COMMAND>\s*(?P<cmd>.+?)\s*</COMMAND>\s*$"
    )
    .unwrap();
    // new style: :HEADER … :PARAMETER_LIST … :COMMAND …
    static ref SECTIONS_NEW: Regex = Regex::new(
        r"(?is)^.*:HEADER\s+(?P<hdr>.*):PARAMETER(_LIST)?\s+(?P<params>.*):COMMAND\s+(?P<cmd>.+)\s*$"
    )
    .unwrap();
    // command-only variants
    static ref COMMAND_OLD: Regex =
        Regex::new(r"(?is)^.*<COMMAND>\s*(?P<cmd>.+?)\s*</COMMAND>\s*$").unwrap();
    static ref COMMAND_NEW: Regex = Regex::new(r"(?is)^.*:COMMAND\s+(?P<cmd>.+)\s*$").unwrap();

    static ref LOAD_RE: Regex = Regex::new(r#"(?i)^\*LOAD\s*"(.+)"\s*$"#).unwrap();
    static ref VARREF_RE: Regex = Regex::new(r"\$[A-Za-z0-9_.]+").unwrap();
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum OpeError {
    #[error("string contents do not match expected format")]
    NoSections,
    #[error("could not locate included PRM file '{0}'")]
    MissingInclude(String),
    #[error("error reading '{0}': {1}")]
    Io(String, String),
    #[error("not all variable references were converted: {0}")]
    Unresolved(String),
}

/// The three textual sections of an OPE or skeleton file.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Sections {
    pub header: String,
    pub params: String,
    pub commands: String,
    /// 1-based line of the surrounding file on which the command
    /// section begins.
    pub command_line: u32,
}

/// Splits a buffer into header, parameter and command sections.
/// Both marker styles are recognized case-insensitively, as is the
/// command-only variant without header and parameter blocks.
pub fn get_sections(buf: &str) -> Result<Sections, OpeError> {
    for regex in [&*SECTIONS_OLD, &*SECTIONS_NEW] {
        if let Some(caps) = regex.captures(buf) {
            let cmd = caps.name("cmd").map(|m| (m.as_str(), m.start()));
            let (cmd_text, cmd_start) = cmd.unwrap_or(("", 0));
            return Ok(Sections {
                header: caps.name("hdr").map(|m| m.as_str().trim()).unwrap_or("").to_owned(),
                params: caps
                    .name("params")
                    .map(|m| m.as_str().trim().replace('\t', " "))
                    .unwrap_or_default(),
                commands: cmd_text.trim().to_owned(),
                command_line: line_of(buf, cmd_start),
            });
        }
    }

    for regex in [&*COMMAND_OLD, &*COMMAND_NEW] {
        if let Some(caps) = regex.captures(buf) {
            let cmd = caps.name("cmd").map(|m| (m.as_str(), m.start()));
            let (cmd_text, cmd_start) = cmd.unwrap_or(("", 0));
            return Ok(Sections {
                header: String::new(),
                params: String::new(),
                commands: cmd_text.trim().to_owned(),
                command_line: line_of(buf, cmd_start),
            });
        }
    }

    Err(OpeError::NoSections)
}

fn line_of(buf: &str, offset: usize) -> u32 {
    buf[..offset].matches('\n').count() as u32 + 1
}

/// Upper-cases everything outside quoted spans; single and double
/// quotes both delimit, and string contents are preserved.
pub fn toupper(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    out.push(c);
                } else {
                    out.extend(c.to_uppercase());
                }
            }
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
        }
    }
    out
}

fn locate_prm(filename: &str, include_dirs: &[PathBuf]) -> Result<PathBuf, OpeError> {
    for dir in include_dirs {
        let path = dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(OpeError::MissingInclude(filename.to_owned()))
}

/// Harvested variables from a parameter block.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct VarMap {
    /// `NAME` → raw value text, names upper-cased.
    pub vars: IndexMap<String, String>,
    /// Problems with `*LOAD` includes; harvesting continues past them.
    pub errors: Vec<String>,
}

impl VarMap {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&name.to_uppercase()).map(String::as_str)
    }
}

/// Builds the substitution dictionary from a `<Parameter_List>`
/// section. `*LOAD "file.prm"` lines prepend the named file (searched
/// through `include_dirs`); `#` comments and `*pattern` lines are
/// skipped; unquoted text folds to upper case.
pub fn get_vars(plist: &str, include_dirs: &[PathBuf]) -> VarMap {
    let mut result = VarMap::default();
    let mut lines: VecDeque<String> = plist.lines().map(str::to_owned).collect();

    while let Some(line) = lines.pop_front() {
        let line = line.trim();

        if let Some(caps) = LOAD_RE.captures(line) {
            let filename = &caps[1];
            match locate_prm(filename, include_dirs) {
                Ok(path) => match fs::read_to_string(&path) {
                    Ok(buf) => {
                        for included in buf.lines().rev() {
                            lines.push_front(included.to_owned());
                        }
                    }
                    Err(e) => result
                        .errors
                        .push(OpeError::Io(path.display().to_string(), e.to_string()).to_string()),
                },
                Err(e) => result.errors.push(e.to_string()),
            }
            continue;
        }

        let line = toupper(line);
        if line.starts_with('#') || line.starts_with('*') || line.is_empty() {
            continue;
        }

        if let Some(idx) = line.find('=') {
            let var = line[..idx].trim().to_owned();
            let val = line[idx + 1..].trim().to_owned();
            result.vars.insert(var, val);
        }
    }
    result
}

/// Convenience over [`get_sections`] + [`get_vars`] for a whole OPE
/// buffer.
pub fn get_vars_ope(opebuf: &str, include_dirs: &[PathBuf]) -> Result<VarMap, OpeError> {
    let sections = get_sections(opebuf)?;
    Ok(get_vars(&sections.params, include_dirs))
}

/// Substitutes `$VAR` references into a command line, longest names
/// first so `$EXPTIME2` never matches `$EXPTIME`. Any surviving `$`
/// reference is an error.
pub fn substitute_params(
    plist: &str,
    cmdstr: &str,
    include_dirs: &[PathBuf],
) -> Result<String, OpeError> {
    let vars = get_vars(plist, include_dirs);
    let mut cmdstr = toupper(cmdstr);

    let mut names: Vec<&String> = vars.vars.keys().collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));

    for name in names {
        let varref = format!("${name}");
        if cmdstr.contains(&varref) {
            if let Some(value) = vars.vars.get(name) {
                cmdstr = cmdstr.replace(&varref, value);
            }
        }
    }

    if let Some(m) = VARREF_RE.find(&cmdstr) {
        return Err(OpeError::Unresolved(cmdstr[m.start()..].to_owned()));
    }
    Ok(cmdstr)
}

/// Extracts one fully substituted command from an OPE buffer.
pub fn extract_command(
    opebuf: &str,
    cmdstr: &str,
    include_dirs: &[PathBuf],
) -> Result<String, OpeError> {
    let sections = get_sections(opebuf)?;
    substitute_params(&sections.params, cmdstr.trim(), include_dirs)
}

/// References found by [`check_ope`].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct OpeReport {
    /// Every `$name` referenced in the command section.
    pub refs: Vec<String>,
    /// References with no definition in the parameter block.
    pub unresolved: Vec<String>,
    pub vars: IndexMap<String, String>,
    pub errors: Vec<String>,
}

/// Scans a whole OPE buffer for variable references and reports the
/// undefined ones without substituting anything.
pub fn check_ope(opebuf: &str, include_dirs: &[PathBuf]) -> Result<OpeReport, OpeError> {
    let sections = get_sections(opebuf)?;
    let varmap = get_vars(&sections.params, include_dirs);

    let mut report = OpeReport {
        errors: varmap.errors.clone(),
        vars: varmap.vars.clone(),
        ..Default::default()
    };

    for line in sections.commands.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        for m in VARREF_RE.find_iter(line) {
            let name = m.as_str()[1..].to_uppercase();
            if !report.refs.contains(&name) {
                report.refs.push(name.clone());
            }
            if varmap.get(&name).is_none() && !report.unresolved.contains(&name) {
                report.unresolved.push(name);
            }
        }
    }
    Ok(report)
}
