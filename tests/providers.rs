mod common;

use common::t0;
use finnews_digest::ingest::providers::facebook::{parse_posts, PostsPage};
use finnews_digest::ingest::providers::rss::RssProvider;
use finnews_digest::ingest::providers::twitter::{parse_timeline, Timeline};
use finnews_digest::ingest::types::{SourceKind, SourceProvider};

const REUTERS: &str = include_str!("fixtures/reuters_markets.xml");
const TIMELINE: &str = include_str!("fixtures/twitter_timeline.json");
const POSTS: &str = include_str!("fixtures/facebook_posts.json");

#[test]
fn rss_fixture_parses_items_with_titles() {
    let feed = RssProvider::from_fixture("Reuters", REUTERS);
    let items = feed.parse_items_from_str(REUTERS, t0()).unwrap();
    assert_eq!(items.len(), 3);

    let fed = &items[0];
    assert_eq!(fed.source_kind, SourceKind::Rss);
    assert_eq!(fed.source_id, "Reuters");
    assert_eq!(fed.external_id, None);
    assert!(fed.title.starts_with("Fed holds rates steady"));
    assert!(fed.published_at.is_some());
    assert_eq!(fed.fetched_at, t0());

    assert_eq!(items[1].external_id.as_deref(), Some("reuters-btc-0917"));
}

#[tokio::test]
async fn rss_fixture_provider_fetches() {
    let feed = RssProvider::from_fixture("Reuters", REUTERS);
    assert_eq!(feed.name(), "Reuters");
    assert_eq!(feed.kind(), SourceKind::Rss);
    let items = feed.fetch_latest().await.unwrap();
    assert_eq!(items.len(), 3);
}

#[test]
fn malformed_rss_is_an_error() {
    let feed = RssProvider::from_fixture("Broken", "<rss><channel>");
    assert!(feed.parse_items_from_str("<rss><channel>", t0()).is_err());
}

#[test]
fn twitter_timeline_skips_blank_posts_and_truncates_titles() {
    let timeline: Timeline = serde_json::from_str(TIMELINE).unwrap();
    let items = parse_timeline("Reuters", &timeline, t0());
    assert_eq!(items.len(), 2);

    let ecb = &items[0];
    assert_eq!(ecb.source_kind, SourceKind::Twitter);
    assert_eq!(ecb.source_id, "@Reuters");
    assert_eq!(ecb.external_id.as_deref(), Some("1836012345678901234"));
    assert_eq!(ecb.url, "https://x.com/Reuters/status/1836012345678901234");
    assert!(ecb.published_at.is_some());

    let gold = &items[1];
    assert!(gold.title.ends_with("..."));
    assert!(gold.body.chars().count() > gold.title.chars().count() - 3);
}

#[test]
fn facebook_posts_without_message_are_skipped() {
    let page: PostsPage = serde_json::from_str(POSTS).unwrap();
    let items = parse_posts("acmecorp", &page, t0());
    assert_eq!(items.len(), 2);

    assert_eq!(items[0].source_kind, SourceKind::Facebook);
    assert_eq!(items[0].url, "https://www.facebook.com/acmecorp/posts/998877");
    assert!(items[0].published_at.is_some());
    assert_eq!(items[1].url, "https://facebook.com/104958162837_998879");
}
