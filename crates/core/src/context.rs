use crate::models::TextbookIndex;

pub const PAGE_SEPARATOR: &str = "\n\n";

/// Concatenates the requested pages in ascending page order, each followed
/// by a blank line. Unknown page numbers are skipped.
pub fn assemble_pages(index: &TextbookIndex, page_numbers: &[u32]) -> String {
    let mut ordered = page_numbers.to_vec();
    ordered.sort_unstable();
    ordered.dedup();

    let mut context = String::new();
    for page_number in ordered {
        if let Some(page) = index.page(page_number) {
            context.push_str(&page.text);
            context.push_str(PAGE_SEPARATOR);
        }
    }
    context
}

/// Up to `before` characters preceding `anchor` and `after` characters from
/// `anchor` onward. `anchor` is a byte offset and is moved back to the
/// nearest char boundary.
pub fn char_window(text: &str, anchor: usize, before: usize, after: usize) -> &str {
    let mut anchor = anchor.min(text.len());
    while !text.is_char_boundary(anchor) {
        anchor -= 1;
    }

    let start = if before == 0 {
        anchor
    } else {
        text[..anchor]
            .char_indices()
            .rev()
            .nth(before - 1)
            .map_or(0, |(offset, _)| offset)
    };

    let end = text[anchor..]
        .char_indices()
        .nth(after)
        .map_or(text.len(), |(offset, _)| anchor + offset);

    &text[start..end]
}

/// "3, 5, 8"
pub fn page_list(page_numbers: &[u32]) -> String {
    page_numbers
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
