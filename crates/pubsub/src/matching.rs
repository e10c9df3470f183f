// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Glob-style channel matching with the same rules pub/sub servers apply to patterns.
//!
//! A pattern can contain:
//! - `*` match 0 or more characters.
//! - `?` match any single character.
//! - `[abc]`, `[a-z]`, `[^a-z]` match one character from (or not from) a class.
//! - `\x` match the character `x` literally.

/// Returns whether `channel` matches the glob `pattern`.
#[must_use]
pub fn is_matching(channel: &str, pattern: &str) -> bool {
    is_matching_bytes(channel.as_bytes(), pattern.as_bytes())
}

/// Matches raw bytes using iterative backtracking to the most recent `*`.
#[must_use]
pub fn is_matching_bytes(channel: &[u8], pattern: &[u8]) -> bool {
    let mut i = 0;
    let mut j = 0;
    // (pattern index after the star, channel index the star currently absorbs up to)
    let mut star: Option<(usize, usize)> = None;

    while i < channel.len() {
        if j < pattern.len() && pattern[j] == b'*' {
            star = Some((j + 1, i));
            j += 1;
            continue;
        }

        if j < pattern.len()
            && let Some(next) = match_single(channel[i], pattern, j)
        {
            i += 1;
            j = next;
            continue;
        }

        // Let the last star absorb one more character and retry from there
        match star {
            Some((star_j, star_i)) => {
                star = Some((star_j, star_i + 1));
                i = star_i + 1;
                j = star_j;
            }
            None => return false,
        }
    }

    while j < pattern.len() && pattern[j] == b'*' {
        j += 1;
    }

    j == pattern.len()
}

/// Returns whether `pattern` contains any glob metacharacters.
#[must_use]
pub fn is_glob(pattern: &str) -> bool {
    pattern.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
}

/// Matches one channel byte against the pattern element at `j`.
///
/// Returns the index of the next pattern element on success.
fn match_single(c: u8, pattern: &[u8], j: usize) -> Option<usize> {
    match pattern[j] {
        b'?' => Some(j + 1),
        b'\\' if j + 1 < pattern.len() => (pattern[j + 1] == c).then_some(j + 2),
        b'[' => match_class(c, pattern, j + 1),
        literal => (literal == c).then_some(j + 1),
    }
}

/// Matches `c` against the class starting just after `[`.
///
/// An unterminated class extends to the end of the pattern.
fn match_class(c: u8, pattern: &[u8], start: usize) -> Option<usize> {
    let mut k = start;
    let negate = k < pattern.len() && matches!(pattern[k], b'^' | b'!');
    if negate {
        k += 1;
    }

    let mut matched = false;

    while k < pattern.len() && pattern[k] != b']' {
        if pattern[k] == b'\\' && k + 1 < pattern.len() {
            matched |= pattern[k + 1] == c;
            k += 2;
        } else if k + 2 < pattern.len() && pattern[k + 1] == b'-' && pattern[k + 2] != b']' {
            let (lo, hi) = if pattern[k] <= pattern[k + 2] {
                (pattern[k], pattern[k + 2])
            } else {
                (pattern[k + 2], pattern[k])
            };
            matched |= (lo..=hi).contains(&c);
            k += 3;
        } else {
            matched |= pattern[k] == c;
            k += 1;
        }
    }

    // Skip the closing bracket when present
    let next = if k < pattern.len() { k + 1 } else { k };

    (matched != negate).then_some(next)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("a", "*", true)]
    #[case("a", "a", true)]
    #[case("a", "b", false)]
    #[case("", "*", true)]
    #[case("", "?", false)]
    #[case("news.sport", "news.*", true)]
    #[case("news", "news.*", false)]
    #[case("news.sport.live", "news.*.live", true)]
    #[case("news.sport.live", "news.*.replay", false)]
    #[case("h1llo", "h?llo", true)]
    #[case("hllo", "h?llo", false)]
    #[case("hello", "h[ae]llo", true)]
    #[case("hillo", "h[ae]llo", false)]
    #[case("hallo", "h[^e]llo", true)]
    #[case("hello", "h[^e]llo", false)]
    #[case("hbllo", "h[a-c]llo", true)]
    #[case("hbllo", "h[c-a]llo", true)]
    #[case("hdllo", "h[a-c]llo", false)]
    #[case("a*b", "a\\*b", true)]
    #[case("axb", "a\\*b", false)]
    #[case("aaaaaaaaaaaaaaaaaaaaaaaab", "a*a*a*a*a*a*b", true)]
    #[case("aaaaaaaaaaaaaaaaaaaaaaaaa", "a*a*a*a*a*a*b", false)]
    #[case("abc", "**c", true)]
    #[case("b", "[", false)]
    #[case("a]", "[a]]", true)]
    fn test_is_matching(#[case] channel: &str, #[case] pattern: &str, #[case] expected: bool) {
        assert_eq!(
            is_matching(channel, pattern),
            expected,
            "channel={channel:?} pattern={pattern:?}"
        );
    }

    #[rstest]
    #[case("news.*", true)]
    #[case("h?llo", true)]
    #[case("h[ae]llo", true)]
    #[case("plain.channel", false)]
    fn test_is_glob(#[case] pattern: &str, #[case] expected: bool) {
        assert_eq!(is_glob(pattern), expected);
    }
}
