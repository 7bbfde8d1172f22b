pub mod admin;
pub mod badges;
pub mod cache;
pub mod compose;
pub mod context;
pub mod detail;
pub mod feed;
pub mod guard;
pub mod interactions;
pub mod pacing;
pub mod resolver;
pub mod session;

pub use admin::{AdminGuard, AdminSession};
pub use badges::{BadgeEvaluator, BadgePolicy, BadgeSpec};
pub use cache::ExpiringCache;
pub use compose::{ComposerService, ImageUpload, PostForm, Published};
pub use context::{AppContext, ContextOptions, Ports};
pub use detail::{CommentView, PostDetail, PostDetailService};
pub use feed::{FeedEvent, FeedIntent, FeedManager, FeedOptions, FeedPage, FeedSnapshot, LoadOutcome, PostCard};
pub use interactions::Reaction;
pub use session::{account_email, Registration, RegistrationForm, SessionService};
