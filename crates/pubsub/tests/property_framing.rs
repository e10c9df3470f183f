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

//! Property-based tests for binary framing and glob channel matching.

use proptest::prelude::*;
use resub_pubsub::{
    binary::{BinaryFrameCodec, FRAME_MARKER, Payload},
    matching::{is_glob, is_matching},
};
use rstest::rstest;

fn channel_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9.:_-]{0,24}"
}

proptest! {
    /// Arbitrary bytes survive framing byte for byte.
    #[rstest]
    fn framed_bytes_decode_identically(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let framed = BinaryFrameCodec::encode(&bytes);
        prop_assert!(BinaryFrameCodec::is_framed(&framed));

        let payload = BinaryFrameCodec::decode_payload(framed).expect("Valid frame");
        prop_assert!(payload.is_binary());
        prop_assert_eq!(payload.as_bytes(), bytes.as_slice());
    }

    /// Text without the marker is delivered untouched.
    #[rstest]
    fn unframed_text_is_unchanged(text in "\\PC{0,64}") {
        prop_assume!(!text.starts_with(FRAME_MARKER));

        let payload = BinaryFrameCodec::decode_payload(text.clone()).expect("Plain text");
        prop_assert_eq!(payload, Payload::Text(text));
    }

    /// Cutting a frame short never yields different bytes.
    #[rstest]
    fn truncated_frame_never_decodes_to_other_bytes(
        bytes in proptest::collection::vec(any::<u8>(), 1..128),
        cut in 1usize..64,
    ) {
        let framed = BinaryFrameCodec::encode(&bytes);
        let end = framed.len().saturating_sub(cut).max(FRAME_MARKER.len());
        let truncated = &framed[..end];

        if let Ok(Some(decoded)) = BinaryFrameCodec::decode(truncated) {
            prop_assert_eq!(decoded.as_ref(), bytes.as_slice());
        }
    }

    /// A channel without metacharacters only matches itself.
    #[rstest]
    fn literal_pattern_matches_only_itself(channel in channel_strategy(), other in channel_strategy()) {
        prop_assert!(!is_glob(&channel));
        prop_assert!(is_matching(&channel, &channel));
        prop_assert_eq!(is_matching(&other, &channel), other == channel);
    }

    /// `prefix*` matches exactly the channels starting with `prefix`.
    #[rstest]
    fn star_suffix_matches_prefix(prefix in channel_strategy(), channel in channel_strategy()) {
        let pattern = format!("{prefix}*");
        prop_assert!(is_glob(&pattern));
        prop_assert_eq!(is_matching(&channel, &pattern), channel.starts_with(&prefix));
        prop_assert!(is_matching(&channel, "*"));
    }

    /// Each `?` consumes exactly one character.
    #[rstest]
    fn question_marks_match_length(channel in channel_strategy(), n in 0usize..30) {
        let pattern = "?".repeat(n);
        prop_assert_eq!(is_matching(&channel, &pattern), channel.len() == n);
    }
}
