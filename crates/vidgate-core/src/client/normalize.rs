use super::wire::{
    ChannelItem, PlaylistItemResource, RawVideoStatistics, SearchItem, Thumbnails, VideoItem,
};
use crate::domain::{
    parse_iso8601_duration, ChannelDetails, PlaylistItem, ResourceKind, SearchHit, UtcDateTime,
    VideoDetails, VideoStatistics, VideoStats,
};

/// Largest thumbnail the provider offers.
pub(super) fn best_thumbnail(thumbnails: Option<&Thumbnails>) -> Option<String> {
    let thumbnails = thumbnails?;
    [
        &thumbnails.maxres,
        &thumbnails.standard,
        &thumbnails.high,
        &thumbnails.medium,
        &thumbnails.default,
    ]
    .into_iter()
    .find_map(|thumbnail| thumbnail.as_ref().map(|t| t.url.clone()))
}

pub(super) fn parse_count(value: Option<&str>) -> Option<u64> {
    value.and_then(|raw| raw.trim().parse().ok())
}

fn parse_published(value: Option<&str>) -> Option<UtcDateTime> {
    value.and_then(UtcDateTime::parse_any_offset)
}

/// Hits whose id does not match their kind are dropped.
pub(super) fn search_hit(item: SearchItem) -> Option<SearchHit> {
    let kind: ResourceKind = item.id.kind.parse().ok()?;
    let id = match kind {
        ResourceKind::Video => item.id.video_id,
        ResourceKind::Channel => item.id.channel_id,
        ResourceKind::Playlist => item.id.playlist_id,
    }?;
    let snippet = item.snippet.unwrap_or_default();

    Some(SearchHit {
        kind,
        id,
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        published_at: parse_published(snippet.published_at.as_deref()),
        title: snippet.title,
        description: snippet.description,
        channel_id: snippet.channel_id,
        channel_title: snippet.channel_title,
    })
}

fn video_statistics(raw: &RawVideoStatistics) -> VideoStatistics {
    VideoStatistics {
        view_count: parse_count(raw.view_count.as_deref()).unwrap_or(0),
        like_count: parse_count(raw.like_count.as_deref()),
        comment_count: parse_count(raw.comment_count.as_deref()),
    }
}

pub(super) fn video_details(item: VideoItem) -> VideoDetails {
    let duration_seconds = item
        .content_details
        .as_ref()
        .and_then(|details| details.duration.as_deref())
        .and_then(|raw| {
            let parsed = parse_iso8601_duration(raw);
            if parsed.is_none() {
                tracing::warn!(video_id = %item.id, duration = raw, "unparseable video duration");
            }
            parsed
        });
    let statistics = item.statistics.as_ref().map(video_statistics);
    let snippet = item.snippet.unwrap_or_default();

    VideoDetails {
        id: item.id,
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        published_at: parse_published(snippet.published_at.as_deref()),
        title: snippet.title,
        description: snippet.description,
        channel_id: snippet.channel_id,
        channel_title: snippet.channel_title,
        duration_seconds,
        tags: snippet.tags.unwrap_or_default(),
        statistics,
    }
}

pub(super) fn video_stats(item: VideoItem) -> VideoStats {
    VideoStats {
        statistics: item
            .statistics
            .as_ref()
            .map(video_statistics)
            .unwrap_or_default(),
        id: item.id,
    }
}

pub(super) fn channel_details(item: ChannelItem) -> ChannelDetails {
    let statistics = item.statistics.unwrap_or_default();
    let snippet = item.snippet.unwrap_or_default();
    let subscriber_count = if statistics.hidden_subscriber_count {
        None
    } else {
        parse_count(statistics.subscriber_count.as_deref())
    };

    ChannelDetails {
        id: item.id,
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        published_at: parse_published(snippet.published_at.as_deref()),
        title: snippet.title,
        description: snippet.description,
        custom_url: snippet.custom_url,
        subscriber_count,
        video_count: parse_count(statistics.video_count.as_deref()),
        view_count: parse_count(statistics.view_count.as_deref()),
        uploads_playlist_id: item
            .content_details
            .and_then(|details| details.related_playlists)
            .and_then(|playlists| playlists.uploads),
    }
}

/// Items without a video id (deleted or private videos) are dropped.
pub(super) fn playlist_item(item: PlaylistItemResource) -> Option<PlaylistItem> {
    let snippet = item.snippet?;
    let details = item.content_details;
    let video_id = details
        .as_ref()
        .and_then(|d| d.video_id.clone())
        .or_else(|| snippet.resource_id.as_ref().and_then(|r| r.video_id.clone()))?;
    let published_at = details
        .as_ref()
        .and_then(|d| parse_published(d.video_published_at.as_deref()))
        .or_else(|| parse_published(snippet.published_at.as_deref()));

    Some(PlaylistItem {
        video_id,
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        title: snippet.title,
        description: snippet.description,
        position: snippet.position.unwrap_or(0),
        published_at,
    })
}
