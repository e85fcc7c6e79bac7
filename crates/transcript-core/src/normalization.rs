use crate::{
    protocol::{FetchKind, PageResult},
    store::WindowOp,
    types::{MergeOptions, Message, Pointer},
};

/// Convert a completed fetch into the window ops that apply it.
///
/// Newest pages replace the window; directional pages merge into it. An edge
/// is reached when the page came back short, or when its extreme matches the
/// conversation-wide pointer reported by the store.
pub fn normalize_page(page: PageResult, page_size: usize, is_active: bool) -> Vec<WindowOp> {
    let PageResult {
        request,
        messages,
        metrics,
    } = page;
    let conversation_id = request.conversation_id;
    let short = messages.len() < page_size;

    match request.kind {
        FetchKind::Newest { around } => {
            let (first, last) = extremes(&messages);
            let have_oldest = messages.is_empty()
                || matches_pointer(metrics.oldest.as_ref(), first)
                || (around.is_none() && short);
            let have_newest = messages.is_empty()
                || around.is_none()
                || matches_pointer(metrics.newest.as_ref(), last);
            let unbounded_fetch = around.is_some();
            vec![
                WindowOp::Reset {
                    conversation_id: conversation_id.clone(),
                    messages,
                    metrics,
                    scroll_to_message_id: around,
                    unbounded_fetch,
                },
                WindowOp::SetEdges {
                    conversation_id,
                    have_oldest: Some(have_oldest),
                    have_newest: Some(have_newest),
                },
            ]
        }
        FetchKind::Older { .. } => vec![
            WindowOp::Merge {
                conversation_id: conversation_id.clone(),
                messages,
                options: MergeOptions {
                    is_active,
                    ..MergeOptions::default()
                },
            },
            WindowOp::SetEdges {
                conversation_id,
                have_oldest: Some(short),
                have_newest: None,
            },
        ],
        FetchKind::Newer { .. } => vec![
            WindowOp::Merge {
                conversation_id: conversation_id.clone(),
                messages,
                options: MergeOptions {
                    is_active,
                    ..MergeOptions::default()
                },
            },
            WindowOp::SetEdges {
                conversation_id,
                have_oldest: None,
                have_newest: Some(short),
            },
        ],
    }
}

fn extremes(messages: &[Message]) -> (Option<&Message>, Option<&Message>) {
    let first = messages.iter().min_by_key(|message| message.sort_key());
    let last = messages.iter().max_by_key(|message| message.sort_key());
    (first, last)
}

fn matches_pointer(pointer: Option<&Pointer>, message: Option<&Message>) -> bool {
    matches!((pointer, message), (Some(pointer), Some(message)) if pointer.id == message.id)
}
