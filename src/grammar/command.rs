// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Grammar for single OPE-file commands.
//!
//! Two forms exist: the device-dependent command
//! `EXEC subsys cmd KEY=value …` and the abstract command
//! `name KEY=value …` implemented by a skeleton file. The result is
//! always wrapped in a one-element `cmdlist`.

use crate::ast::{Ast, AstItem, AstKind};
use crate::lexer::TokenKind;
use crate::parser::{Parse, ParseResult, Parser};

use super::{parse_factor, parse_param_list};

pub(crate) fn parse_opecmd(p: &mut Parser) -> ParseResult<Ast> {
    let cmd = if p.at(TokenKind::ExecKw) {
        parse_dd_cmd(p)?
    } else {
        parse_abs_cmd(p)?
    };

    let mut list = Ast::new(AstKind::CmdList);
    list.append(cmd);
    Ok(list)
}

fn parse_dd_cmd(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::ExecKw)?;
    let subsys = parse_factor(p)?;
    let cmd = parse_factor(p)?;
    let params = parse_param_list(p)?;
    Ok(Ast::with_items(
        AstKind::Exec,
        vec![subsys.into(), cmd.into(), params.into(), AstItem::Nil],
    ))
}

fn parse_abs_cmd(p: &mut Parser) -> ParseResult<Ast> {
    let name = parse_factor(p)?;
    let params = parse_param_list(p)?;
    Ok(Ast::with_items(
        AstKind::AbsCmd,
        vec![name.into(), params.into()],
    ))
}

/// Parses one OPE command line into `cmdlist(<cmd>)`.
pub fn parse_ope_command(input: &str) -> Parse {
    let mut p = Parser::new(input);
    let ast = match parse_opecmd(&mut p) {
        Ok(ast) => {
            if !p.at_eof() {
                let err = p.error_here("trailing input after command");
                p.record(err);
            }
            ast
        }
        Err(err) => {
            p.record(err);
            Ast::new(AstKind::CmdList)
        }
    };
    p.finish(ast)
}
