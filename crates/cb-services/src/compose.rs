//! Post composition: publishing with images, and drafts.
//!
//! Everything is validated before the viewer's session is even looked at,
//! so a bad form never costs a remote call.

use std::sync::Arc;

use bytes::Bytes;
use cb_core::validation::{validate_body, validate_price, validate_title};
use cb_core::{
    decode_row, encode_row, AppError, Category, Clock, DataGateway, Draft, NewPost, ObjectStore, Post, PostImage,
    PostStatus, Result, Table, Viewer, Visibility,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::guard::SubmitGuard;

pub const IMAGE_BUCKET: &str = "post-images";
pub const MAX_IMAGES: usize = 5;

/// What the viewer typed into the composer.
#[derive(Debug, Clone)]
pub struct PostForm {
    pub title: String,
    pub body: String,
    pub category: Category,
    pub visibility: Visibility,
    pub anonymous: bool,
    /// Raw price text; only read for marketplace posts.
    pub price: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl ImageUpload {
    /// Upload for a picked file, typed from its extension. Unknown extensions
    /// get `application/octet-stream` and are then refused by validation.
    pub fn from_file(file_name: impl Into<String>, data: Bytes) -> Self {
        let file_name = file_name.into();
        let content_type = mime_guess::from_path(&file_name).first_or_octet_stream().to_string();
        Self { file_name, content_type, data }
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub post: Post,
    pub images: Vec<PostImage>,
    /// File names that could not be stored; the post is published regardless.
    pub failed_uploads: Vec<String>,
}

/// A form that passed validation, trimmed and normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedPost {
    pub title: String,
    pub body: String,
    pub price: Option<f64>,
    pub anonymous: bool,
}

pub fn validate_post(form: &PostForm) -> Result<CheckedPost> {
    let title = form.title.trim();
    let body = form.body.trim();
    validate_title(title)?;
    validate_body(body)?;

    let price = match form.category {
        Category::Marketplace => {
            let raw = form
                .price
                .as_deref()
                .ok_or_else(|| AppError::ValidationFailed("price is required for marketplace posts".into()))?;
            Some(validate_price(raw)?)
        }
        _ => None,
    };
    // Only the confession wall offers anonymous posting.
    let anonymous = form.anonymous && form.category == Category::ConfessionWall;

    Ok(CheckedPost { title: title.to_string(), body: body.to_string(), price, anonymous })
}

pub fn validate_images(images: &[ImageUpload]) -> Result<()> {
    if images.len() > MAX_IMAGES {
        return Err(AppError::ValidationFailed(format!("at most {MAX_IMAGES} images per post")));
    }
    for image in images {
        let is_image = image
            .content_type
            .parse::<mime::Mime>()
            .map(|m| m.type_() == mime::IMAGE)
            .unwrap_or(false);
        if !is_image {
            return Err(AppError::ValidationFailed(format!("{} is not an image", image.file_name)));
        }
    }
    Ok(())
}

pub struct ComposerService {
    gateway: Arc<dyn DataGateway>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    viewer: Viewer,
    publishing: SubmitGuard,
}

impl ComposerService {
    pub fn new(gateway: Arc<dyn DataGateway>, store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, viewer: Viewer) -> Self {
        Self { gateway, store, clock, viewer, publishing: SubmitGuard::new() }
    }

    fn author(&self) -> Result<Uuid> {
        self.viewer
            .user_id()
            .ok_or_else(|| AppError::NotAuthenticated("sign in to post".into()))
    }

    /// Creates the post in review status, then stores its images one by one.
    pub async fn publish(&self, form: &PostForm, images: Vec<ImageUpload>) -> Result<Published> {
        let checked = validate_post(form)?;
        validate_images(&images)?;
        let author_id = self.author()?;
        let _ticket = self.publishing.try_acquire(format!("publish:{author_id}"))?;

        let row = encode_row(&NewPost {
            author_id,
            title: checked.title,
            body: checked.body,
            category: form.category,
            visibility: form.visibility,
            status: PostStatus::PendingReview,
            price: checked.price,
            anonymous: checked.anonymous,
        })?;
        let inserted = self
            .gateway
            .insert(Table::Posts, vec![row])
            .await
            .map_err(|e| AppError::remote("publish post", e))?;
        let post: Post = match inserted.into_iter().next() {
            Some(row) => decode_row(row)?,
            None => return Err(AppError::RemoteFailed("publish post: backend returned no row".into())),
        };
        info!(post_id = %post.id, %author_id, "post submitted for review");

        let mut stored = Vec::new();
        let mut failed_uploads = Vec::new();
        for image in images {
            let file_name = image.file_name.clone();
            match self.attach_image(post.id, image).await {
                Ok(record) => stored.push(record),
                Err(e) => {
                    warn!(post_id = %post.id, file = %file_name, error = %e, "image upload failed");
                    failed_uploads.push(file_name);
                }
            }
        }

        Ok(Published { post, images: stored, failed_uploads })
    }

    async fn attach_image(&self, post_id: Uuid, image: ImageUpload) -> Result<PostImage> {
        let path = format!("posts/{post_id}/{}-{}", self.clock.now().timestamp_millis(), image.file_name);
        self.store
            .upload(IMAGE_BUCKET, &path, image.data, &image.content_type)
            .await
            .map_err(|e| AppError::remote("upload image", e))?;

        let record = PostImage { post_id, image_url: self.store.public_url(IMAGE_BUCKET, &path).await };
        self.gateway
            .insert(Table::PostImages, vec![encode_row(&record)?])
            .await
            .map_err(|e| AppError::remote("record image", e))?;
        Ok(record)
    }

    /// Saves whatever is in the composer. Needs a title or a body, nothing more.
    pub async fn save_draft(&self, form: &PostForm) -> Result<Draft> {
        if form.title.trim().is_empty() && form.body.trim().is_empty() {
            return Err(AppError::ValidationFailed("a draft needs a title or a body".into()));
        }
        let author_id = self.author()?;

        let price = match form.category {
            Category::Marketplace => form.price.as_deref().and_then(|p| p.trim().parse::<f64>().ok()),
            _ => None,
        };
        let draft = Draft {
            author_id,
            title: form.title.clone(),
            body: form.body.clone(),
            category: form.category,
            visibility: form.visibility,
            anonymous: form.anonymous,
            price,
            created_at: self.clock.now(),
        };
        self.gateway
            .insert(Table::Drafts, vec![encode_row(&draft)?])
            .await
            .map_err(|e| AppError::remote("save draft", e))?;
        info!(%author_id, "draft saved");
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cb_core::MockDataGateway;
    use cb_gateway_memory::{ManualClock, MemoryGateway, MemoryObjectStore};

    fn form(title: &str) -> PostForm {
        PostForm {
            title: title.into(),
            body: "Lost a blue umbrella near the gym".into(),
            category: Category::LostAndFound,
            visibility: Visibility::Community,
            anonymous: false,
            price: None,
        }
    }

    fn image(name: &str) -> ImageUpload {
        ImageUpload { file_name: name.into(), content_type: "image/png".into(), data: Bytes::from_static(b"png") }
    }

    fn member() -> Viewer {
        Viewer::Authenticated { user_id: Uuid::now_v7(), community: Some("north".into()) }
    }

    fn composer(gateway: Arc<MemoryGateway>, store: Arc<dyn ObjectStore>) -> ComposerService {
        ComposerService::new(gateway, store, Arc::new(ManualClock::starting_now()), member())
    }

    /// Rejects any object whose path mentions "broken".
    struct PickyStore(MemoryObjectStore);

    #[async_trait]
    impl ObjectStore for PickyStore {
        async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> anyhow::Result<()> {
            if path.contains("broken") {
                anyhow::bail!("payload too large");
            }
            self.0.upload(bucket, path, data, content_type).await
        }

        async fn public_url(&self, bucket: &str, path: &str) -> String {
            self.0.public_url(bucket, path).await
        }
    }

    #[tokio::test]
    async fn test_long_title_rejected_before_any_remote_call() {
        let mut gateway = MockDataGateway::new();
        gateway.expect_insert().never();
        gateway.expect_current_session().never();
        let service = ComposerService::new(
            Arc::new(gateway),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ManualClock::starting_now()),
            Viewer::Anonymous,
        );

        let err = service.publish(&form(&"x".repeat(51)), vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_anonymous_viewer_cannot_publish() {
        let gateway = Arc::new(MemoryGateway::new());
        let service = ComposerService::new(
            gateway.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ManualClock::starting_now()),
            Viewer::Anonymous,
        );
        let err = service.publish(&form("Umbrella"), vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::NotAuthenticated(_)));
        assert!(gateway.rows(Table::Posts).await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_goes_to_review_with_images() {
        let gateway = Arc::new(MemoryGateway::new());
        let store = Arc::new(MemoryObjectStore::new());
        let service = composer(gateway.clone(), store.clone());

        let published = service.publish(&form("Umbrella"), vec![image("a.png"), image("b.png")]).await.unwrap();
        assert_eq!(published.post.status, PostStatus::PendingReview);
        assert_eq!(published.images.len(), 2);
        assert!(published.failed_uploads.is_empty());
        assert!(published.images[0].image_url.contains(&format!("posts/{}/", published.post.id)));
        assert!(published.images[0].image_url.ends_with("-a.png"));
        assert_eq!(store.len(), 2);
        assert_eq!(gateway.rows(Table::PostImages).await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_upload_is_reported_not_fatal() {
        let gateway = Arc::new(MemoryGateway::new());
        let service = composer(gateway.clone(), Arc::new(PickyStore(MemoryObjectStore::new())));

        let published = service.publish(&form("Umbrella"), vec![image("ok.png"), image("broken.png")]).await.unwrap();
        assert_eq!(published.images.len(), 1);
        assert_eq!(published.failed_uploads, vec!["broken.png".to_string()]);
        assert_eq!(gateway.rows(Table::Posts).await.len(), 1);
    }

    #[tokio::test]
    async fn test_image_limits() {
        let gateway = Arc::new(MemoryGateway::new());
        let service = composer(gateway.clone(), Arc::new(MemoryObjectStore::new()));

        let six: Vec<_> = (0..6).map(|i| image(&format!("{i}.png"))).collect();
        assert!(matches!(service.publish(&form("Umbrella"), six).await, Err(AppError::ValidationFailed(_))));

        let mut pdf = image("notes.pdf");
        pdf.content_type = "application/pdf".into();
        assert!(matches!(service.publish(&form("Umbrella"), vec![pdf]).await, Err(AppError::ValidationFailed(_))));
        assert!(gateway.rows(Table::Posts).await.is_empty());
    }

    #[test]
    fn test_upload_type_guessed_from_file_name() {
        assert_eq!(ImageUpload::from_file("IMG_0042.JPG", Bytes::new()).content_type, "image/jpeg");
        let unknown = ImageUpload::from_file("scan.zzz", Bytes::new());
        assert_eq!(unknown.content_type, "application/octet-stream");
        assert!(validate_images(&[unknown]).is_err());
    }

    #[test]
    fn test_price_only_kept_for_marketplace() {
        let mut listing = form("Desk lamp");
        listing.category = Category::Marketplace;
        assert!(validate_post(&listing).is_err());
        listing.price = Some("12.50".into());
        assert_eq!(validate_post(&listing).unwrap().price, Some(12.5));

        let mut social = form("Picnic");
        social.category = Category::Social;
        social.price = Some("12.50".into());
        assert_eq!(validate_post(&social).unwrap().price, None);
    }

    #[test]
    fn test_anonymous_only_on_confession_wall() {
        let mut confession = form("To the person in row 3");
        confession.category = Category::ConfessionWall;
        confession.anonymous = true;
        assert!(validate_post(&confession).unwrap().anonymous);

        let mut other = form("Umbrella");
        other.anonymous = true;
        assert!(!validate_post(&other).unwrap().anonymous);
    }

    #[tokio::test]
    async fn test_draft_needs_title_or_body() {
        let gateway = Arc::new(MemoryGateway::new());
        let service = composer(gateway.clone(), Arc::new(MemoryObjectStore::new()));

        let mut empty = form("");
        empty.body = "  ".into();
        assert!(matches!(service.save_draft(&empty).await, Err(AppError::ValidationFailed(_))));

        let mut half = form("");
        half.body = "half a thought".into();
        let draft = service.save_draft(&half).await.unwrap();
        assert_eq!(draft.body, "half a thought");
        assert_eq!(gateway.rows(Table::Drafts).await.len(), 1);
    }
}
