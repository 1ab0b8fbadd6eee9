// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Shared parameter-list and expression grammar.
//!
//! This is the common core under the skeleton-program grammar and the
//! OPE-command grammar: `KEY=value` parameter lists and the arithmetic
//! and logical expression language used everywhere values appear.

pub mod command;
pub mod para;
pub mod skeleton;

use crate::ast::{Ast, AstItem, AstKind};
use crate::lexer::TokenKind;
use crate::parser::{Parse, ParseResult, Parser};

//  Expression parsing follows
//    https://matklad.github.io/2020/04/13/simple-but-powerful-pratt-parsing.html
//  with the binding powers spelling out the language's precedence table:
//  OR/AND < NOT < comparisons < additive < multiplicative < unary minus.

const OR_AND_BP: (u8, u8) = (1, 2);
const NOT_BP: u8 = 4;
const CMP_BP: (u8, u8) = (5, 6);
const ADD_BP: (u8, u8) = (7, 8);
const MUL_BP: (u8, u8) = (9, 10);
const UMINUS_BP: u8 = 11;

fn infix_bp(op: TokenKind) -> Option<(u8, u8)> {
    use TokenKind::*;
    match op {
        OrKw | AndKw => Some(OR_AND_BP),
        Eq | Ne | Lt | Le | Gt | Ge => Some(CMP_BP),
        Add | Sub => Some(ADD_BP),
        Mul | Div => Some(MUL_BP),
        _ => None,
    }
}

fn is_comparison(op: TokenKind) -> bool {
    use TokenKind::*;
    matches!(op, Eq | Ne | Lt | Le | Gt | Ge)
}

/// Parses a bare parameter list: `(ID '=' expression)*`.
pub(crate) fn parse_param_list(p: &mut Parser) -> ParseResult<Ast> {
    let mut list = Ast::new(AstKind::ParamList);
    while p.at(TokenKind::Word) && p.nth(1) == TokenKind::Assign {
        list.append(parse_key_value_pair(p)?);
    }
    Ok(list)
}

pub(crate) fn parse_key_value_pair(p: &mut Parser) -> ParseResult<Ast> {
    let key = p.expect(TokenKind::Word)?;
    p.expect(TokenKind::Assign)?;
    let value = parse_expr(p)?;

    let mut kv = Ast::new(AstKind::KeyValuePair);
    kv.append(key.text.to_lowercase());
    kv.append(value);
    Ok(kv)
}

/// Parses `kv (',' kv)*` into a `kwd_params` node.
pub(crate) fn parse_kwd_params(p: &mut Parser) -> ParseResult<Ast> {
    let mut params = Ast::new(AstKind::KwdParams);
    params.append(parse_key_value_pair(p)?);
    while p.eat(TokenKind::Comma) {
        params.append(parse_key_value_pair(p)?);
    }
    Ok(params)
}

pub(crate) fn parse_expr(p: &mut Parser) -> ParseResult<Ast> {
    expr_bp(p, 0)
}

fn expr_bp(p: &mut Parser, min_bp: u8) -> ParseResult<Ast> {
    let mut lhs = match p.kind() {
        TokenKind::Sub => {
            let op = p.bump();
            let rhs = expr_bp(p, UMINUS_BP)?;
            Ast::with_items(AstKind::Monad, vec![op.text.into(), rhs.into()])
        }
        // '+x' is just x
        TokenKind::Add => {
            p.bump();
            expr_bp(p, UMINUS_BP)?
        }
        TokenKind::NotKw => {
            let op = p.bump();
            let rhs = expr_bp(p, NOT_BP)?;
            Ast::with_items(AstKind::Monad, vec![op.text.into(), rhs.into()])
        }
        _ => parse_factor(p)?,
    };

    loop {
        let op = p.kind();
        let Some((l_bp, r_bp)) = infix_bp(op) else {
            break;
        };
        if l_bp < min_bp {
            break;
        }

        let op_tok = p.bump();
        let rhs = expr_bp(p, r_bp)?;
        lhs = Ast::with_items(
            AstKind::Dyad,
            vec![lhs.into(), op_tok.text.into(), rhs.into()],
        );

        // comparison operators do not chain
        if is_comparison(op) && is_comparison(p.kind()) {
            return Err(p.error_here("comparison operators are non-associative"));
        }
    }

    Ok(lhs)
}

/// Whether the current token can begin an expression.
pub(crate) fn at_expr_start(p: &Parser) -> bool {
    use TokenKind::*;
    matches!(
        p.kind(),
        Num | IdRef
            | AliasRef
            | RegRef
            | GetFNo
            | Word
            | AndKw
            | OrKw
            | NotKw
            | LStr
            | QStr
            | LParen
            | Add
            | Sub
    )
}

pub(crate) fn parse_factor(p: &mut Parser) -> ParseResult<Ast> {
    match p.kind() {
        TokenKind::Num => {
            let tok = p.bump();
            Ok(number_node(&tok.text))
        }
        TokenKind::IdRef => {
            let tok = p.bump();
            Ok(Ast::with_items(AstKind::IdRef, vec![tok.text[1..].into()]))
        }
        TokenKind::AliasRef => {
            let tok = p.bump();
            Ok(Ast::with_items(
                AstKind::AliasRef,
                vec![tok.text[1..].into()],
            ))
        }
        TokenKind::RegRef => {
            let tok = p.bump();
            let name = tok.text[1..].to_owned();
            if p.at(TokenKind::LParen) {
                parse_proc_call(p, name)
            } else {
                Ok(Ast::with_items(AstKind::RegRef, vec![name.into()]))
            }
        }
        TokenKind::GetFNo => {
            p.bump();
            let spec = p.expect(TokenKind::LStr)?;
            Ok(Ast::with_items(AstKind::FrameIdRef, vec![spec.text.into()]))
        }
        TokenKind::Word => {
            let tok = p.bump();
            if p.at(TokenKind::LParen) {
                p.bump();
                let args = parse_arg_list(p)?;
                p.expect(TokenKind::RParen)?;
                Ok(Ast::with_items(
                    AstKind::FuncCall,
                    vec![tok.text.into(), args.into()],
                ))
            } else {
                Ok(Ast::with_items(AstKind::Str, vec![tok.text.into()]))
            }
        }
        // reserved words used like ordinary strings
        TokenKind::AndKw | TokenKind::OrKw => {
            let tok = p.bump();
            Ok(Ast::with_items(AstKind::Str, vec![tok.text.into()]))
        }
        TokenKind::LStr => {
            let tok = p.bump();
            Ok(Ast::with_items(AstKind::LStr, vec![tok.text.into()]))
        }
        TokenKind::QStr => {
            let tok = p.bump();
            Ok(Ast::with_items(AstKind::QStr, vec![tok.text.into()]))
        }
        TokenKind::LParen => {
            p.bump();
            let inner = parse_expr(p)?;
            p.expect(TokenKind::RParen)?;
            Ok(Ast::with_items(AstKind::AsNum, vec![inner.into()]))
        }
        _ => Err(p.error_here("expected an expression")),
    }
}

fn parse_proc_call(p: &mut Parser, name: String) -> ParseResult<Ast> {
    p.expect(TokenKind::LParen)?;
    if p.eat(TokenKind::RParen) {
        return Ok(Ast::with_items(
            AstKind::ProcCall,
            vec![name.into(), AstItem::Nil],
        ));
    }
    let args = parse_arg_list(p)?;
    p.expect(TokenKind::RParen)?;
    Ok(Ast::with_items(
        AstKind::ProcCall,
        vec![name.into(), args.into()],
    ))
}

/// Parses `expression_list (',' kwd_params)? | kwd_params`, flattened
/// into a single `arg_list` whose positional items precede the
/// `key_value_pair` items.
pub(crate) fn parse_arg_list(p: &mut Parser) -> ParseResult<Ast> {
    let mut args = Ast::new(AstKind::ArgList);
    if p.at(TokenKind::RParen) {
        return Ok(args);
    }

    let mut saw_keyword = false;
    loop {
        if p.at(TokenKind::Word) && p.nth(1) == TokenKind::Assign {
            saw_keyword = true;
            args.append(parse_key_value_pair(p)?);
        } else if saw_keyword {
            return Err(p.error_here("positional argument after keyword argument"));
        } else {
            args.append(parse_expr(p)?);
        }
        if !p.eat(TokenKind::Comma) {
            break;
        }
    }
    Ok(args)
}

pub(crate) fn number_node(text: &str) -> Ast {
    let item = if text.contains('.') {
        match text.parse::<f64>() {
            Ok(v) => AstItem::Float(v),
            Err(_) => AstItem::Str(text.to_owned()),
        }
    } else {
        match text.parse::<i64>() {
            Ok(v) => AstItem::Int(v),
            Err(_) => match text.parse::<f64>() {
                Ok(v) => AstItem::Float(v),
                Err(_) => AstItem::Str(text.to_owned()),
            },
        }
    };
    Ast::with_items(AstKind::Number, vec![item])
}

/// Parses a bare parameter list buffer (e.g. a skeleton's default
/// parameter block re-joined into one line).
pub fn parse_params(input: &str) -> Parse {
    let mut p = Parser::new(input);
    let ast = match parse_param_list(&mut p) {
        Ok(ast) => {
            if !p.at_eof() {
                let err = p.error_here("expected KEY=value");
                p.record(err);
            }
            ast
        }
        Err(err) => {
            p.record(err);
            Ast::new(AstKind::ParamList)
        }
    };
    p.finish(ast)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    /// Helper to compare a parsed tree with the expected dump.
    pub(crate) fn check<F>(input: &str, f: F, expected: Expect)
    where
        F: Fn(&mut Parser) -> ParseResult<Ast>,
    {
        let mut parser = Parser::new(input);
        let ast = f(&mut parser).expect("parse failed");
        assert!(parser.errors.is_empty(), "{:?}", parser.errors);
        expected.assert_eq(&ast.tree_string());
    }

    #[test]
    fn test_parse_number_literals() {
        check(
            "5",
            parse_expr,
            expect![[r#"
                number
                  5
            "#]],
        );
        check(
            "5.5",
            parse_expr,
            expect![[r#"
                number
                  5.5
            "#]],
        );
    }

    #[test]
    fn test_parse_refs() {
        check(
            "$EXPTIME",
            parse_expr,
            expect![[r#"
                id_ref
                  "EXPTIME"
            "#]],
        );
        check(
            "!TSCS.ALPHA",
            parse_expr,
            expect![[r#"
                alias_ref
                  "TSCS.ALPHA"
            "#]],
        );
        check(
            "@COUNT",
            parse_expr,
            expect![[r#"
                reg_ref
                  "COUNT"
            "#]],
        );
    }

    #[test]
    fn test_parse_precedence() {
        check(
            "1 + 2 * 3",
            parse_expr,
            expect![[r#"
                dyad
                  number
                    1
                  "+"
                  dyad
                    number
                      2
                    "*"
                    number
                      3
            "#]],
        );
    }

    #[test]
    fn test_parse_left_assoc_additive() {
        check(
            "1 - 2 + 3",
            parse_expr,
            expect![[r#"
                dyad
                  dyad
                    number
                      1
                    "-"
                    number
                      2
                  "+"
                  number
                    3
            "#]],
        );
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        check(
            "NOT $A == 1",
            parse_expr,
            expect![[r#"
                monad
                  "NOT"
                  dyad
                    id_ref
                      "A"
                    "=="
                    number
                      1
            "#]],
        );
    }

    #[test]
    fn test_comparison_does_not_chain() {
        let mut p = Parser::new("1 == 2 == 3");
        assert!(parse_expr(&mut p).is_err());
    }

    #[test]
    fn test_unary_minus() {
        check(
            "-$X + 1",
            parse_expr,
            expect![[r#"
                dyad
                  monad
                    "-"
                    id_ref
                      "X"
                  "+"
                  number
                    1
            "#]],
        );
    }

    #[test]
    fn test_asnum_grouping() {
        check(
            "($A + 1) * 2",
            parse_expr,
            expect![[r#"
                dyad
                  asnum
                    dyad
                      id_ref
                        "A"
                      "+"
                      number
                        1
                  "*"
                  number
                    2
            "#]],
        );
    }

    #[test]
    fn test_func_and_proc_calls() {
        check(
            "MAX(1, $B, N=2)",
            parse_expr,
            expect![[r#"
                func_call
                  "MAX"
                  arg_list
                    number
                      1
                    id_ref
                      "B"
                    key_value_pair
                      "n"
                      number
                        2
            "#]],
        );
        check(
            "@DITHER()",
            parse_expr,
            expect![[r#"
                proc_call
                  "DITHER"
                  nil
            "#]],
        );
    }

    #[test]
    fn test_frame_id_ref() {
        check(
            "&GET_F_NO[SPCAM A]",
            parse_expr,
            expect![[r#"
                frame_id_ref
                  "SPCAM A"
            "#]],
        );
    }

    #[test]
    fn test_reserved_words_as_strings() {
        check(
            "AND",
            parse_expr,
            expect![[r#"
                string
                  "AND"
            "#]],
        );
    }

    #[test]
    fn test_param_list_keys_fold_lower() {
        let parse = parse_params("MODE=\"ON\" Exptime=10");
        assert!(parse.ok());
        expect![[r#"
            param_list
              key_value_pair
                "mode"
                qstring
                  "ON"
              key_value_pair
                "exptime"
                number
                  10
        "#]]
        .assert_eq(&parse.ast.tree_string());
    }

    #[test]
    fn test_param_list_trailing_junk_is_recorded() {
        let parse = parse_params("MODE=1 ;");
        assert_eq!(parse.errors.len(), 1);
    }
}
