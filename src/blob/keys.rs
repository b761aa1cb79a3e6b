//! Deterministic object keys
//!
//! Keys depend only on entity kind, id and (for photo assets) the photo's
//! storage location, so redelivered events overwrite the same objects.

use sha2::{Digest, Sha256};

use crate::model::{FaceId, PhotoAsset, PhotoId};

/// S3 hard limit on key length in UTF-8 bytes.
const MAX_KEY_BYTES: usize = 1024;
const MAX_SEGMENT_CHARS: usize = 100;

pub fn face_key(face_id: FaceId) -> String {
    format!("faces/{:010}.jpg", face_id)
}

pub fn photo_key(
    asset: PhotoAsset,
    storage_name: &str,
    relative_path: Option<&str>,
    photo_id: PhotoId,
) -> String {
    let file_name = format!("{:010}_{}.jpg", photo_id, asset.as_str());

    let mut prefix = String::from(asset.as_str());
    prefix.push('/');
    prefix.push_str(&slugify_segment(storage_name));

    let relative = relative_path.unwrap_or_default().replace('\\', "/");
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        let segment = slugify_segment(segment);
        prefix.push('/');
        prefix.push_str(&segment);
    }

    let key = format!("{}/{}", prefix, file_name);
    if key.len() <= MAX_KEY_BYTES {
        return key;
    }

    let hash8 = short_hash(&key);
    let shortened = shorten_path(&prefix, &file_name, MAX_KEY_BYTES - (1 + hash8.len()));
    format!("{}-{}", shortened, hash8)
}

fn slugify_segment(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;

    for ch in value.trim().chars().filter(|c| !c.is_control()) {
        if ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            if ch == '-' {
                pending_dash = true;
            } else {
                slug.push(ch);
            }
        } else {
            pending_dash = true;
        }
    }

    let slug: String = slug.chars().take(MAX_SEGMENT_CHARS).collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..4])
}

/// Trim path segments (never the leading scope) until `prefix/file_name` fits.
fn shorten_path(prefix: &str, file_name: &str, limit: usize) -> String {
    let mut segments: Vec<String> = prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let fits = |segs: &[String]| segs.join("/").len() + 1 + file_name.len() <= limit;

    for i in 1..segments.len() {
        while !fits(&segments) && segments[i].chars().count() > 6 {
            let keep = segments[i].chars().count() - 1;
            segments[i] = segments[i].chars().take(keep.max(3)).collect();
        }
        if fits(&segments) {
            break;
        }
    }

    format!("{}/{}", segments.join("/"), file_name)
}
