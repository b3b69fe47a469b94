use async_trait::async_trait;

use parley_core::content::{ContentSource, PageContent};
use parley_core::errors::ContentError;
use parley_core::ids::ContentId;

/// Frozen copy of a content source, kept after the live source navigated
/// away or when a conversation is restored from storage.
#[derive(Clone, Debug)]
pub struct ArchivedContent {
    content_id: ContentId,
    url: String,
    title: String,
    content: PageContent,
}

impl ArchivedContent {
    pub fn new(content_id: ContentId, url: String, title: String, content: PageContent) -> Self {
        Self {
            content_id,
            url,
            title,
            content,
        }
    }

    /// Capture `source` as it is now, with `content` as its last known text.
    pub fn snapshot(source: &dyn ContentSource, content: PageContent) -> Self {
        Self::new(source.content_id(), source.url(), source.title(), content)
    }

    pub fn content(&self) -> &PageContent {
        &self.content
    }
}

#[async_trait]
impl ContentSource for ArchivedContent {
    fn content_id(&self) -> ContentId {
        self.content_id
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    async fn fetch_content(&self) -> Result<PageContent, ContentError> {
        Ok(self.content.clone())
    }

    fn cached_text(&self) -> String {
        self.content.text.clone()
    }

    fn cached_is_video(&self) -> bool {
        self.content.is_video
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContentSource;

    #[tokio::test]
    async fn snapshot_is_frozen() {
        let live = MockContentSource::new(ContentId(7), "https://a.test", "live text");
        live.set_title("A");
        let archive = ArchivedContent::snapshot(&live, PageContent::new("live text", true));

        live.set_url("https://b.test");
        live.set_text("changed");

        assert_eq!(archive.url(), "https://a.test");
        assert_eq!(archive.title(), "A");
        assert_eq!(archive.content_id(), ContentId(7));
        let fetched = archive.fetch_content().await.unwrap();
        assert_eq!(fetched.text, "live text");
        assert!(fetched.is_video);
        assert!(archive.cached_is_video());
    }
}
