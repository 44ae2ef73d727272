//! Route path patterns
//! 路由路径模式
//!
//! A pattern is a path in which `:name` introduces a parameter. A parameter matches a
//! non-empty run of characters other than `/`; everything else must match literally
//! and the whole path must be consumed.
//! 模式是一个路径，其中 `:name` 表示参数。参数匹配不含 `/` 的非空字符序列；
//! 其余部分必须逐字匹配，且必须匹配整个路径。

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Param(String),
}

/// Compiled path pattern / 编译后的路径模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    tokens: Vec<Token>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl PathPattern {
    /// Compile a pattern / 编译模式
    pub fn compile(source: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            let starts_param = c == ':' && chars.peek().is_some_and(|next| is_name_char(*next));
            if !starts_param {
                literal.push(c);
                continue;
            }

            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            let mut name = String::new();
            while let Some(next) = chars.peek().copied().filter(|c| is_name_char(*c)) {
                name.push(next);
                chars.next();
            }
            tokens.push(Token::Param(name));
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self {
            source: source.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parameter names in declaration order / 按声明顺序排列的参数名
    pub fn param_names(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Param(name) => Some(name.as_str()),
                Token::Literal(_) => None,
            })
            .collect()
    }

    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Match a concrete path, returning the captured parameters
    /// 匹配具体路径，返回捕获的参数
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        if self.is_literal() {
            return (self.source == path).then(HashMap::new);
        }

        let mut captures = Vec::with_capacity(self.tokens.len());
        if !match_from(&self.tokens, path, &mut captures) {
            return None;
        }

        // Later captures win for repeated names, as with named regex groups rebuilt into a map
        Some(captures.into_iter().collect())
    }
}

fn match_from(tokens: &[Token], rest: &str, captures: &mut Vec<(String, String)>) -> bool {
    let Some((token, remaining)) = tokens.split_first() else {
        return rest.is_empty();
    };

    match token {
        Token::Literal(lit) => match rest.strip_prefix(lit.as_str()) {
            Some(after) => match_from(remaining, after, captures),
            None => false,
        },
        Token::Param(name) => {
            let run = rest.find('/').unwrap_or(rest.len());
            if run == 0 {
                return false;
            }

            // Greedy first, then back off one character at a time
            let mut ends: Vec<usize> = rest[..run]
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .collect();
            ends.reverse();

            for end in ends {
                captures.push((name.clone(), rest[..end].to_string()));
                if match_from(remaining, &rest[end..], captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
    }
}
