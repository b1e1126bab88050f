// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line tokenization for module option strings.

use alloc::string::String;
use mantle_sys::domain_params::MAX_CMDLINE_ARGS;
use smallvec::SmallVec;

pub type ArgList = SmallVec<[String; 8]>;

/// Splits `s` on ASCII space/tab outside double quotes. Quote marks are
/// consumed; adjacent whitespace collapses. Yields at most
/// `MAX_CMDLINE_ARGS` tokens: once the limit is reached the final token
/// absorbs the rest of the string verbatim, quote marks included.
pub fn tokenize_cmdargs(s: &str) -> ArgList {
    let mut argv = ArgList::new();
    let mut cur = String::new();
    let mut started = false;
    let mut inquote = false;

    for c in s.chars() {
        let splitting = argv.len() + 1 < MAX_CMDLINE_ARGS;
        match c {
            '"' if splitting => {
                inquote = !inquote;
                started = true;
            }
            ' ' | '\t' if splitting && !inquote => {
                if started {
                    argv.push(core::mem::take(&mut cur));
                    started = false;
                }
            }
            _ => {
                cur.push(c);
                started = true;
            }
        }
    }
    if started {
        argv.push(cur);
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> { tokenize_cmdargs(s).into_vec() }

    #[test]
    fn test_simple() {
        assert_eq!(tokens("hello arg1 arg2"), ["hello", "arg1", "arg2"]);
    }

    #[test]
    fn test_whitespace_collapses() {
        assert_eq!(tokens("  foo \"bar baz\" qux  "), ["foo", "bar baz", "qux"]);
        assert_eq!(tokens("a\t\t b"), ["a", "b"]);
    }

    #[test]
    fn test_empty() {
        assert!(tokens("").is_empty());
        assert!(tokens("   \t ").is_empty());
    }

    #[test]
    fn test_quotes_consumed() {
        assert_eq!(tokens("a\"b\"c"), ["abc"]);
        assert_eq!(tokens("\"quoted\""), ["quoted"]);
        assert_eq!(tokens("\"\""), [""]);
    }

    #[test]
    fn test_unterminated_quote_runs_to_end() {
        assert_eq!(tokens("foo \"bar baz"), ["foo", "bar baz"]);
    }

    #[test]
    fn test_argc_capped() {
        let long: String = (0..2 * MAX_CMDLINE_ARGS)
            .map(|i| format!("a{} ", i))
            .collect();
        let argv = tokenize_cmdargs(&long);
        assert_eq!(argv.len(), MAX_CMDLINE_ARGS);
    }

    #[test]
    fn test_capped_tail_kept_verbatim() {
        let mut input: String = (0..MAX_CMDLINE_ARGS - 1)
            .map(|i| format!("a{} ", i))
            .collect();
        input.push_str("tail \"quoted bit\"  end");
        let argv = tokenize_cmdargs(&input);
        assert_eq!(argv.len(), MAX_CMDLINE_ARGS);
        // Past the cap nothing is split, collapsed or unquoted.
        assert_eq!(argv[MAX_CMDLINE_ARGS - 1], "tail \"quoted bit\"  end");
    }

    // Joining the tokens with single spaces is lexically equivalent to
    // the whitespace-normalized input (for unquoted input).
    #[test]
    fn test_join_roundtrip() {
        let input = "  spawnd  core=1   bootscript ";
        let joined = tokens(input).join(" ");
        let normalized: Vec<&str> = input.split_whitespace().collect();
        assert_eq!(joined, normalized.join(" "));
    }
}
