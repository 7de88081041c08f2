//! MP3 hash derivation: strip ID3v2, then ID3v1 (up to twice — observed in
//! the wild), then APE, in that order. Grounded on `fileanalyzer.cpp`'s
//! `analyzeMp3`/`stripID3v1`/`stripAPE`.

use color_eyre::Result;

use super::{AnalysisResult, AudioData, TagData, ID3V1_TAG_SIZE, hash_of, strip_id3v1};

const APE_FOOTER_SIZE: usize = 32;

/// Strip a leading ID3v2 tag if present. Returns the remaining bytes
/// unchanged (as a fresh copy) when no tag is found.
fn strip_id3v2(data: &[u8]) -> &[u8] {
    if data.len() < 10 || &data[0..3] != b"ID3" {
        return data;
    }
    let flags = data[5];
    let has_footer = flags & 0x10 != 0;
    let size = syncsafe_u32(&data[6..10]);
    let header_len = 10usize;
    let footer_len = if has_footer { 10 } else { 0 };
    let total = header_len + size as usize + footer_len;
    if total > data.len() {
        return data;
    }
    &data[total..]
}

fn syncsafe_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32) << 21) | ((bytes[1] as u32) << 14) | ((bytes[2] as u32) << 7) | (bytes[3] as u32)
}

/// Strip a trailing APE tag (v1 or v2) identified by a 32-byte footer whose
/// first 8 bytes are `"APETAGEX"`. The footer carries the tag's total size
/// (header+body+footer minus header-if-absent) and a flags word whose top
/// bit says whether a matching header is also present at the start of the
/// tag (APEv2 without a header omits it to save space).
fn strip_ape(data: &[u8]) -> &[u8] {
    if data.len() < APE_FOOTER_SIZE {
        return data;
    }
    let footer_start = data.len() - APE_FOOTER_SIZE;
    let footer = &data[footer_start..];
    if &footer[0..8] != b"APETAGEX" {
        return data;
    }
    let tag_size = u32::from_le_bytes(footer[12..16].try_into().unwrap());
    let flags = u32::from_le_bytes(footer[20..24].try_into().unwrap());
    let header_present = flags & 0x8000_0000 != 0;

    let body_and_footer = tag_size as usize;
    let header_len = if header_present { APE_FOOTER_SIZE } else { 0 };
    let total_tag_len = header_len + body_and_footer;
    if total_tag_len > data.len() {
        return data;
    }
    let tag_start = data.len() - total_tag_len;
    &data[..tag_start]
}

pub fn analyze(contents: &[u8]) -> Result<AnalysisResult> {
    let after_id3v2 = strip_id3v2(contents);
    let legacy_hash_candidate = hash_of(after_id3v2);

    let after_id3v1_first = strip_id3v1(after_id3v2);
    let after_id3v1_second = strip_id3v1(after_id3v1_first);
    let after_ape = strip_ape(after_id3v1_second);

    let final_hash = hash_of(after_ape);
    let legacy_hash = (legacy_hash_candidate != final_hash).then_some(legacy_hash_candidate);

    let tags = read_tags(contents);
    let audio = AudioData { duration_ms: estimate_duration_ms(after_ape) };

    Ok(AnalysisResult { hash: final_hash, legacy_hash, audio, tags })
}

fn read_tags(contents: &[u8]) -> TagData {
    use lofty::{file::TaggedFileExt, probe::Probe, tag::{Accessor, ItemKey}};

    let Ok(tagged) = Probe::new(std::io::Cursor::new(contents)).guess_file_type().and_then(|p| p.read()) else {
        return TagData::default();
    };
    let Some(tag) = tagged.primary_tag() else {
        return TagData::default();
    };

    TagData {
        title: tag.title().map(|s| s.to_string()),
        artist: tag.artist().map(|s| s.to_string()),
        album: tag.album().map(|s| s.to_string()),
        // MP3 prefers the TPE2 (band/orchestra/accompaniment, i.e. album
        // artist) frame over the generic album-artist item key.
        album_artist: tag
            .get_string(&ItemKey::AlbumArtist)
            .map(|s| s.to_string())
            .or_else(|| tag.get_string(&ItemKey::TrackArtist).map(|s| s.to_string())),
        comment: tag.comment().map(|s| s.to_string()),
    }
}

fn estimate_duration_ms(audio_bytes: &[u8]) -> i32 {
    // rough estimate via lofty's properties reader over the stripped
    // buffer; a dedicated decoder is out of scope for the analyzer.
    use lofty::{file::AudioFile, probe::Probe};
    Probe::new(std::io::Cursor::new(audio_bytes))
        .guess_file_type()
        .ok()
        .and_then(|p| p.read().ok())
        .map(|f| f.properties().duration().as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id3v2_tag(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"ID3");
        out.extend_from_slice(&[4, 0]); // version 2.4.0
        out.push(0); // flags: no footer
        let size = body.len() as u32;
        out.extend_from_slice(&[
            ((size >> 21) & 0x7f) as u8,
            ((size >> 14) & 0x7f) as u8,
            ((size >> 7) & 0x7f) as u8,
            (size & 0x7f) as u8,
        ]);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn strips_id3v2_header_and_body() {
        let audio = b"audio-data-payload";
        let mut file = id3v2_tag(b"some tag frames here");
        file.extend_from_slice(audio);
        assert_eq!(strip_id3v2(&file), audio);
    }

    #[test]
    fn strips_trailing_id3v1_tag() {
        let audio = b"audio-data-payload";
        let mut file = audio.to_vec();
        let mut tag = vec![0u8; ID3V1_TAG_SIZE];
        tag[0..3].copy_from_slice(b"TAG");
        file.extend_from_slice(&tag);
        assert_eq!(strip_id3v1(&file), audio);
    }

    #[test]
    fn does_not_misdetect_ape_tail_as_id3v1() {
        let audio = b"audio-data-payload";
        let mut file = audio.to_vec();
        // "APETAGEX" starting 3 bytes before the would-be ID3v1 tag start
        // means the last 128 bytes are really the tail of an APE footer:
        // "APETAGEX"[3..6] == "TAG", so the naive 128-byte-from-the-end
        // scan finds a spurious "TAG" marker right in the middle of it.
        let mut tail = b"APETAGEX".to_vec();
        tail.resize(ID3V1_TAG_SIZE + 3, 0);
        file.extend_from_slice(&tail);
        assert_eq!(strip_id3v1(&file), file);
    }

    #[test]
    fn hash_is_stable_across_id3v2_tag_changes() {
        let audio = b"same-audio-bytes-every-time";
        let mut file_a = id3v2_tag(b"title=Foo");
        file_a.extend_from_slice(audio);
        let mut file_b = id3v2_tag(b"title=SomethingElseEntirely");
        file_b.extend_from_slice(audio);

        let a = analyze(&file_a).unwrap();
        let b = analyze(&file_b).unwrap();
        assert_eq!(a.hash, b.hash);
    }
}
