// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Token definition for the [`logos`] lexer over skeleton and OPE
//! command text.
//!
//! Bare words lex as [`TokenKind::Word`]; the lexer wrapper re-tags a
//! word as [`TokenKind::Num`] when it is all-numeric and as a reserved
//! keyword after case folding. The keyword variants therefore carry no
//! `logos` attributes of their own.

use std::fmt;

#[derive(logos::Logos, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenKind {
    #[regex(r"[ \t\r]+")]
    Whitespace,

    #[regex(r"\n")]
    Newline,

    // a backslash immediately before a newline continues the line
    #[regex(r"\\\n")]
    LineCont,

    #[regex(r"#[^\n]*")]
    Comment,

    #[token(":START", ignore(case))]
    Start,

    #[token(":MAIN_START", ignore(case))]
    MainStart,

    #[token(":MAIN_END", ignore(case))]
    MainEnd,

    #[token(":END", ignore(case))]
    End,

    #[token("*IF", ignore(case))]
    StarIf,

    #[token("*ELIF", ignore(case))]
    StarElif,

    #[token("*ELSE", ignore(case))]
    StarElse,

    #[token("*ENDIF", ignore(case))]
    StarEndif,

    #[token("*SET", ignore(case))]
    StarSet,

    #[token("*SUB", ignore(case))]
    StarSub,

    #[token("*FOR", ignore(case))]
    StarFor,

    #[token("*ENDFOR", ignore(case))]
    StarEndfor,

    #[token("&GET_F_NO", ignore(case))]
    GetFNo,

    // 'Variable' reference
    #[regex(r"\$[a-zA-Z0-9_][a-zA-Z0-9_.]*")]
    IdRef,

    // 'Status' reference
    #[regex(r"![a-zA-Z0-9_][a-zA-Z0-9_.]*")]
    AliasRef,

    // 'Register' reference
    #[regex(r"@[a-zA-Z0-9_][a-zA-Z0-9_.]*")]
    RegRef,

    #[regex(r#""([^"\\\n]|\\[\s\S])*""#)]
    QStr,

    // single-quoted; re-tagged to QStr by the wrapper
    #[regex(r"'([^'\\\n]|\\[\s\S])*'")]
    SqStr,

    #[regex(r"\[[^\]]*\]")]
    LStr,

    // Overlaps with Word for anything starting with a digit; Word wins
    // there and the wrapper converts all-numeric words back to Num.
    #[regex(r"[0-9.]+", priority = 1)]
    Num,

    #[regex(r"[a-zA-Z0-9][a-zA-Z0-9_.:]*", priority = 3)]
    Word,

    #[token("==")]
    Eq,

    #[token("!=")]
    Ne,

    #[token(">=")]
    Ge,

    #[token("<=")]
    Le,

    #[token(">")]
    Gt,

    #[token("<")]
    Lt,

    #[token("=")]
    Assign,

    #[token("+")]
    Add,

    #[token("-")]
    Sub,

    #[token("*")]
    Mul,

    #[token("/")]
    Div,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("{")]
    LCurBracket,

    #[token("}")]
    RCurBracket,

    #[token("[")]
    LSqrBracket,

    #[token("]")]
    RSqrBracket,

    #[token(",")]
    Comma,

    #[token(";")]
    Semicolon,

    // reserved words, emitted by the wrapper only
    ExecKw,
    AsnKw,
    IfKw,
    ElifKw,
    ElseKw,
    EndifKw,
    WhileKw,
    RaiseKw,
    CatchKw,
    DefKw,
    ReturnKw,
    FromKw,
    ImportKw,
    LetKw,
    InKw,
    AndKw,
    OrKw,
    NotKw,

    /// Marker for an unmatched character, produced by the wrapper only.
    Error,

    /// Marker token to indicate end of input, not used by lexer directly.
    Eof,
}

impl TokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            Self::Whitespace | Self::Newline | Self::LineCont | Self::Comment
        )
    }

    /// The keyword kind for an upper-cased word, if it is reserved.
    pub fn reserved(word: &str) -> Option<TokenKind> {
        let kind = match word {
            "EXEC" => Self::ExecKw,
            "ASN" => Self::AsnKw,
            "IF" => Self::IfKw,
            "ELIF" => Self::ElifKw,
            "ELSE" => Self::ElseKw,
            "ENDIF" => Self::EndifKw,
            "WHILE" => Self::WhileKw,
            "RAISE" => Self::RaiseKw,
            "CATCH" => Self::CatchKw,
            "DEF" => Self::DefKw,
            "RETURN" => Self::ReturnKw,
            "FROM" => Self::FromKw,
            "IMPORT" => Self::ImportKw,
            "LET" => Self::LetKw,
            "IN" => Self::InKw,
            "AND" => Self::AndKw,
            "OR" => Self::OrKw,
            "NOT" => Self::NotKw,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos::Logos;

    fn check(input: &str, kind: TokenKind) {
        let mut lexer = TokenKind::lexer(input);
        assert_eq!(lexer.next(), Some(Ok(kind)));
        assert_eq!(lexer.slice(), input);
    }

    #[test]
    fn lex_section_markers() {
        check(":START", TokenKind::Start);
        check(":MAIN_START", TokenKind::MainStart);
        check(":main_end", TokenKind::MainEnd);
        check(":END", TokenKind::End);
    }

    #[test]
    fn lex_star_keywords_any_case() {
        check("*IF", TokenKind::StarIf);
        check("*endif", TokenKind::StarEndif);
        check("*Sub", TokenKind::StarSub);
    }

    #[test]
    fn lex_refs_keep_sigil() {
        check("$EXPTIME", TokenKind::IdRef);
        check("!TSCS.ALPHA", TokenKind::AliasRef);
        check("@DITH_COUNT", TokenKind::RegRef);
    }

    #[test]
    fn lex_word_wins_over_num() {
        // all-numeric words are re-tagged by the wrapper, not here
        check("123", TokenKind::Word);
        check("1.2.3", TokenKind::Word);
        check(".5", TokenKind::Num);
    }

    #[test]
    fn lex_ne_vs_alias() {
        check("!=", TokenKind::Ne);
        check("!FLAG", TokenKind::AliasRef);
    }

    #[test]
    fn lex_list_string_beats_bracket() {
        check("[A B C]", TokenKind::LStr);
        check("[", TokenKind::LSqrBracket);
    }
}
