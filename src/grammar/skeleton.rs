// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Grammar for the skeleton-file command language.
//!
//! A skeleton body is three sections, `:START … :MAIN_START …
//! :MAIN_END … :END`, each holding a command list. Commands terminated
//! with `;` run synchronously, with `,` asynchronously; special forms
//! (`IF`, `WHILE`, `CATCH`, `DEF`, `LET`, …) stand on their own.

use crate::ast::{Ast, AstItem, AstKind};
use crate::lexer::TokenKind;
use crate::parser::{Parse, ParseResult, Parser};

use super::{
    at_expr_start, parse_expr, parse_factor, parse_kwd_params, parse_param_list,
};

/// Parses the command part of a skeleton file into a `command_section`.
///
/// `start_line` is the 1-based line of the surrounding file on which the
/// command part begins, so error records line up with the source.
pub fn parse_sk_commands(input: &str, start_line: u32) -> Parse {
    let mut p = Parser::with_start_line(input, start_line);
    let ast = parse_program(&mut p);
    p.finish(ast)
}

pub(crate) fn parse_program(p: &mut Parser) -> Ast {
    if let Err(err) = p.expect(TokenKind::Start) {
        p.record(err);
        p.recover(&[TokenKind::Start, TokenKind::MainStart]);
        p.eat(TokenKind::Start);
    }
    let preamble = parse_command_list(p, &[TokenKind::MainStart]);

    if let Err(err) = p.expect(TokenKind::MainStart) {
        p.record(err);
    }
    let mainpart = parse_command_list(p, &[TokenKind::MainEnd]);
    if let Err(err) = p.expect(TokenKind::MainEnd) {
        p.record(err);
    }

    let endpart = parse_command_list(p, &[TokenKind::End]);
    if let Err(err) = p.expect(TokenKind::End) {
        p.record(err);
    }

    Ast::with_items(
        AstKind::CommandSection,
        vec![preamble.into(), mainpart.into(), endpart.into()],
    )
}

/// Parses commands until one of `terminators` (or end of input). An
/// empty list degrades to a single `nop` node. Statement errors are
/// recorded and parsing re-synchronizes at the next boundary.
fn parse_command_list(p: &mut Parser, terminators: &[TokenKind]) -> Ast {
    let mut list = Ast::new(AstKind::CmdList);

    while !p.at_eof() && !terminators.contains(&p.kind()) {
        match parse_statement(p) {
            Ok(stmt) => {
                if stmt.kind != AstKind::Nop {
                    list.append(stmt);
                }
            }
            Err(err) => {
                p.record(err);
                let mut sync = vec![TokenKind::Semicolon, TokenKind::Comma];
                sync.extend_from_slice(terminators);
                p.recover(&sync);
                if p.at(TokenKind::Semicolon) || p.at(TokenKind::Comma) {
                    p.bump();
                }
            }
        }
    }

    if list.is_empty() {
        Ast::new(AstKind::Nop)
    } else {
        list
    }
}

fn parse_statement(p: &mut Parser) -> ParseResult<Ast> {
    match p.kind() {
        TokenKind::ExecKw => {
            let cmd = parse_exec_command(p)?;
            wrap_separator(p, cmd, true)
        }
        TokenKind::Word => {
            if p.nth(1) == TokenKind::Assign && p.nth(2) == TokenKind::ExecKw {
                let cmd = parse_exec_command(p)?;
                wrap_separator(p, cmd, true)
            } else {
                Err(p.error_here("expected a command or special form"))
            }
        }
        TokenKind::LCurBracket => {
            let block = parse_block(p)?;
            wrap_separator(p, block, true)
        }
        TokenKind::RegRef => {
            let call = parse_factor(p)?;
            if call.kind != AstKind::ProcCall {
                return Err(p.error_here("expected a procedure call"));
            }
            wrap_separator(p, call, true)
        }
        TokenKind::StarSub => {
            let cmd = parse_star_sub(p)?;
            wrap_separator(p, cmd, false)
        }
        TokenKind::WhileKw => {
            let stmt = parse_while(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::LetKw => {
            let stmt = parse_let(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::CatchKw => {
            let stmt = parse_catch(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::IfKw => {
            let stmt = parse_if(p, false)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::StarIf => {
            let stmt = parse_if(p, true)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::StarFor => {
            let stmt = parse_star_for(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::AsnKw => {
            let stmt = parse_set(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::StarSet => {
            let stmt = parse_star_set(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::DefKw => {
            let stmt = parse_proc_defn(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::FromKw => {
            let stmt = parse_import(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::RaiseKw => {
            let stmt = parse_raise(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::ReturnKw => {
            let stmt = parse_return(p)?;
            wrap_separator(p, stmt, false)
        }
        TokenKind::Semicolon | TokenKind::Comma => Err(p.error_here("unexpected separator")),
        _ => Err(p.error_here("expected a command or special form")),
    }
}

/// Wraps a command in `sync`/`async` according to its separator. For
/// plain commands (`required`) the separator is mandatory; special
/// forms may stand bare.
fn wrap_separator(p: &mut Parser, cmd: Ast, required: bool) -> ParseResult<Ast> {
    // a statement that degraded to nop swallows its separator
    if cmd.kind == AstKind::Nop {
        let _ = p.eat(TokenKind::Semicolon) || p.eat(TokenKind::Comma);
        return Ok(cmd);
    }
    if p.eat(TokenKind::Semicolon) {
        Ok(Ast::with_items(AstKind::Sync, vec![cmd.into()]))
    } else if p.eat(TokenKind::Comma) {
        Ok(Ast::with_items(AstKind::Async, vec![cmd.into()]))
    } else if required {
        Err(p.error_here("expected ';' or ',' after command"))
    } else {
        Ok(cmd)
    }
}

/// `[var =] EXEC subsys cmd KEY=value …`
fn parse_exec_command(p: &mut Parser) -> ParseResult<Ast> {
    let mut resvar = AstItem::Nil;
    if p.at(TokenKind::Word) {
        let var = p.bump();
        p.expect(TokenKind::Assign)?;
        resvar = var.text.into();
    }
    p.expect(TokenKind::ExecKw)?;
    let subsys = parse_factor(p)?;
    let cmd = parse_factor(p)?;
    let params = parse_param_list(p)?;
    Ok(Ast::with_items(
        AstKind::Exec,
        vec![subsys.into(), cmd.into(), params.into(), resvar],
    ))
}

/// `*SUB name KEY=value …`
fn parse_star_sub(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::StarSub)?;
    let name = parse_factor(p)?;
    let params = parse_param_list(p)?;
    Ok(Ast::with_items(
        AstKind::StarSub,
        vec![name.into(), params.into()],
    ))
}

/// `{ command_list }`; the braces do not nest a `cmdlist` inside the
/// `block` node, the commands become the block's own items.
fn parse_block(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::LCurBracket)?;
    let inner = parse_command_list(p, &[TokenKind::RCurBracket]);
    p.expect(TokenKind::RCurBracket)?;

    let mut block = Ast::new(AstKind::Block);
    if inner.kind == AstKind::CmdList {
        block.items = inner.items;
    }
    Ok(block)
}

/// `IF e … ELIF e … ELSE … ENDIF` and the `*IF` preprocessor twin.
fn parse_if(p: &mut Parser, star: bool) -> ParseResult<Ast> {
    let (if_kw, elif_kw, else_kw, endif_kw, kind) = if star {
        (
            TokenKind::StarIf,
            TokenKind::StarElif,
            TokenKind::StarElse,
            TokenKind::StarEndif,
            AstKind::StarIf,
        )
    } else {
        (
            TokenKind::IfKw,
            TokenKind::ElifKw,
            TokenKind::ElseKw,
            TokenKind::EndifKw,
            AstKind::IfList,
        )
    };

    p.expect(if_kw)?;
    let pred = parse_expr(p)?;
    let body = parse_command_list(p, &[elif_kw, else_kw, endif_kw]);
    let then_empty = body.kind == AstKind::Nop;

    let mut node = Ast::new(kind);
    node.append(Ast::with_items(
        AstKind::Cond,
        vec![pred.into(), body.into()],
    ));

    let mut has_elif = false;
    while p.at(elif_kw) {
        has_elif = true;
        p.bump();
        let pred = parse_expr(p)?;
        let body = parse_command_list(p, &[elif_kw, else_kw, endif_kw]);
        node.append(Ast::with_items(
            AstKind::Cond,
            vec![pred.into(), body.into()],
        ));
    }

    let mut has_else = false;
    if p.eat(else_kw) {
        let body = parse_command_list(p, &[endif_kw]);
        // an empty ELSE clause is dropped entirely
        if body.kind != AstKind::Nop {
            has_else = true;
            node.append(Ast::with_items(
                AstKind::Cond,
                vec![AstItem::Bool(true), body.into()],
            ));
        }
    }
    p.expect(endif_kw)?;

    // bare `IF e ENDIF` degrades to a nop
    if then_empty && !has_elif && !has_else {
        return Ok(Ast::new(AstKind::Nop));
    }
    Ok(node)
}

/// `*FOR count var … IN [sequence] … *ENDFOR`
fn parse_star_for(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::StarFor)?;
    let count = parse_expr(p)?;

    let mut idlist = Ast::new(AstKind::IdList);
    while !p.at(TokenKind::InKw) && !p.at_eof() {
        idlist.append(parse_expr(p)?);
    }
    p.expect(TokenKind::InKw)?;

    let seq = if at_seq_expr(p) {
        parse_expr(p)?.into()
    } else {
        AstItem::Nil
    };

    let body = parse_command_list(p, &[TokenKind::StarEndfor]);
    p.expect(TokenKind::StarEndfor)?;

    Ok(Ast::with_items(
        AstKind::StarFor,
        vec![count.into(), idlist.into(), seq, body.into()],
    ))
}

/// After `IN`, a word may begin either the optional sequence expression
/// or the loop body; commands are recognizable from their lookahead.
fn at_seq_expr(p: &Parser) -> bool {
    match p.kind() {
        TokenKind::Word => p.nth(1) != TokenKind::Assign,
        TokenKind::RegRef => p.nth(1) == TokenKind::LParen,
        _ => at_expr_start(p),
    }
}

/// `WHILE e { … }`
fn parse_while(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::WhileKw)?;
    let pred = parse_expr(p)?;
    let body = parse_block(p)?;
    Ok(Ast::with_items(
        AstKind::While,
        vec![pred.into(), body.into()],
    ))
}

/// `LET k=v, … IN { … }`
fn parse_let(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::LetKw)?;
    let params = parse_kwd_params(p)?;
    p.expect(TokenKind::InKw)?;
    let body = parse_block(p)?;
    Ok(Ast::with_items(
        AstKind::Let,
        vec![params.into(), body.into()],
    ))
}

/// `ASN k=v, …`
fn parse_set(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::AsnKw)?;
    let params = parse_kwd_params(p)?;
    Ok(Ast::with_items(AstKind::Set, vec![params.into()]))
}

/// `*SET [-flag …] KEY=value …`
fn parse_star_set(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::StarSet)?;

    let mut flags = Ast::new(AstKind::VarList);
    while p.at(TokenKind::Sub) && p.nth(1) == TokenKind::Word {
        p.bump();
        let flag = p.bump();
        flags.append(flag.text);
    }

    let params = parse_param_list(p)?;
    let flags = if flags.is_empty() {
        AstItem::Nil
    } else {
        flags.into()
    };
    Ok(Ast::with_items(AstKind::StarSet, vec![params.into(), flags]))
}

/// `DEF name(var, …) { … }`
fn parse_proc_defn(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::DefKw)?;
    let name = p.expect(TokenKind::Word)?;
    p.expect(TokenKind::LParen)?;
    let varlist = parse_varlist(p)?;
    p.expect(TokenKind::RParen)?;
    let body = parse_block(p)?;
    Ok(Ast::with_items(
        AstKind::Proc,
        vec![name.text.into(), varlist.into(), body.into()],
    ))
}

/// `FROM "module" IMPORT var, …`
fn parse_import(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::FromKw)?;
    let module = p.expect(TokenKind::QStr)?;
    p.expect(TokenKind::ImportKw)?;
    let varlist = parse_varlist(p)?;
    Ok(Ast::with_items(
        AstKind::Import,
        vec![module.text.into(), varlist.into()],
    ))
}

fn parse_varlist(p: &mut Parser) -> ParseResult<Ast> {
    let mut varlist = Ast::new(AstKind::VarList);
    let first = p.expect(TokenKind::Word)?;
    varlist.append(first.text);
    while p.eat(TokenKind::Comma) {
        let var = p.expect(TokenKind::Word)?;
        varlist.append(var.text);
    }
    Ok(varlist)
}

/// `CATCH var { … }`
fn parse_catch(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::CatchKw)?;
    let var = p.expect(TokenKind::Word)?;
    let body = parse_block(p)?;
    Ok(Ast::with_items(
        AstKind::Catch,
        vec![var.text.into(), body.into()],
    ))
}

/// `RAISE e`
fn parse_raise(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::RaiseKw)?;
    let expr = parse_expr(p)?;
    Ok(Ast::with_items(AstKind::Raise, vec![expr.into()]))
}

/// `RETURN [e]`
fn parse_return(p: &mut Parser) -> ParseResult<Ast> {
    p.expect(TokenKind::ReturnKw)?;
    if at_expr_start(p) {
        let expr = parse_expr(p)?;
        Ok(Ast::with_items(AstKind::Return, vec![expr.into()]))
    } else {
        Ok(Ast::new(AstKind::Return))
    }
}
