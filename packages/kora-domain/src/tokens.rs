use unicode_segmentation::UnicodeSegmentation;

use crate::chat::ChatMessage;

const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Approximate token count: one per word, plus one per non-word grapheme run.
pub fn estimate(text: &str) -> usize {
	let mut words = 0;
	let mut wide = 0;

	for word in text.unicode_words() {
		let graphemes = word.graphemes(true).count();

		// Scripts without spaces arrive as one long "word".
		if word.chars().any(|c| !c.is_ascii()) && graphemes > 4 {
			wide += graphemes.div_ceil(2);
		} else {
			words += 1;
		}
	}

	words + wide
}

pub fn estimate_messages(messages: &[ChatMessage]) -> usize {
	messages
		.iter()
		.map(|message| {
			let calls: usize = message
				.tool_calls
				.iter()
				.map(|call| estimate(&call.name) + estimate(&call.arguments))
				.sum();

			MESSAGE_OVERHEAD_TOKENS + estimate(&message.content) + calls
		})
		.sum()
}
