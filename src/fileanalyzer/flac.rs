//! FLAC hash derivation: strip Vorbis comments (and any other tag blocks)
//! via a tag-writer strip+save pass, then manually strip ID3v1 (FLAC files
//! occasionally carry a stray trailing ID3v1 tag from lax taggers), then
//! strip the `fLaC` signature and every `METADATA_BLOCK` up to and
//! including the one whose last-block flag is set. Grounded on
//! `fileanalyzer.cpp`'s `analyzeFlac`/`stripFlacHeaders`.

use color_eyre::{Result, eyre::bail};

use super::{AnalysisResult, AudioData, TagData, ID3V1_TAG_SIZE, hash_of, strip_id3v1};

const FLAC_SIGNATURE: &[u8] = b"fLaC";

/// Remove Vorbis-comment / picture / other metadata blocks by re-reading
/// the file through `lofty` with its tags cleared and re-serializing. Doing
/// this via the tag library (rather than hand-walking every block type)
/// matches the original's "tag-writer strip+save" step, which leans on
/// TagLib for the same reason: metadata block contents are numerous and
/// version-specific, but the container framing that follows is simple
/// enough to walk by hand.
fn strip_tags_via_lofty(contents: &[u8]) -> Result<Vec<u8>> {
    use lofty::{config::WriteOptions, file::TaggedFileExt, probe::Probe};

    let mut cursor = std::io::Cursor::new(contents.to_vec());
    let mut tagged = Probe::new(&mut cursor)
        .guess_file_type()?
        .read()
        .map_err(|e| color_eyre::eyre::eyre!("failed to probe flac file: {e}"))?;

    for tag in tagged.tags_mut() {
        tag.clear();
    }

    let mut out = std::io::Cursor::new(Vec::new());
    tagged
        .save_to(&mut out, WriteOptions::default())
        .map_err(|e| color_eyre::eyre::eyre!("failed to re-save stripped flac: {e}"))?;
    Ok(out.into_inner())
}

/// Walk every `METADATA_BLOCK` after the `fLaC` signature, stopping once
/// the last-metadata-block flag (top bit of the block's first byte) is
/// seen, and return everything from that point on (the raw audio frames).
fn strip_flac_headers(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 4 || &data[0..4] != FLAC_SIGNATURE {
        bail!("missing fLaC signature");
    }
    let mut offset = 4usize;
    loop {
        if data.len() < offset + 4 {
            bail!("truncated METADATA_BLOCK header at offset {offset}");
        }
        let header = data[offset];
        let is_last = header & 0x80 != 0;
        let block_len = u32::from_be_bytes([0, data[offset + 1], data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + block_len;
        if is_last {
            break;
        }
    }
    if offset > data.len() {
        bail!("METADATA_BLOCK chain runs past end of file");
    }
    Ok(&data[offset..])
}

pub fn analyze(contents: &[u8]) -> Result<AnalysisResult> {
    let tags = read_tags(contents);

    let stripped = strip_tags_via_lofty(contents)?;
    // ID3v1 tags can be appended twice by lax taggers.
    let after_id3v1_first = strip_id3v1(&stripped);
    let after_id3v1_second = strip_id3v1(after_id3v1_first);
    let audio_only = strip_flac_headers(after_id3v1_second)?;

    let hash = hash_of(audio_only);
    let audio = AudioData { duration_ms: estimate_duration_ms(contents) };

    // FLAC has no separate "legacy" intermediate: the original only keeps
    // one around for MP3's ID3v2-only milestone.
    Ok(AnalysisResult { hash, legacy_hash: None, audio, tags })
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
        album_artist: tag.get_string(&ItemKey::AlbumArtist).map(|s| s.to_string()),
        comment: tag.comment().map(|s| s.to_string()),
    }
}

fn estimate_duration_ms(contents: &[u8]) -> i32 {
    use lofty::{file::AudioFile, probe::Probe};
    Probe::new(std::io::Cursor::new(contents))
        .guess_file_type()
        .ok()
        .and_then(|p| p.read().ok())
        .map(|f| f.properties().duration().as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flac_with_one_block(block_body: &[u8], is_last: bool, audio: &[u8]) -> Vec<u8> {
        let mut out = FLAC_SIGNATURE.to_vec();
        let mut header = 0u8;
        if is_last {
            header |= 0x80;
        }
        out.push(header);
        let len = block_body.len() as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.extend_from_slice(block_body);
        out.extend_from_slice(audio);
        out
    }

    #[test]
    fn strips_single_metadata_block() {
        let audio = b"raw-flac-frames";
        let file = flac_with_one_block(b"STREAMINFO-ish-bytes", true, audio);
        assert_eq!(strip_flac_headers(&file).unwrap(), audio);
    }

    #[test]
    fn rejects_missing_signature() {
        assert!(strip_flac_headers(b"not a flac file at all").is_err());
    }

    #[test]
    fn strips_trailing_id3v1() {
        let audio = b"raw-flac-frames";
        let mut file = audio.to_vec();
        let mut tag = vec![0u8; ID3V1_TAG_SIZE];
        tag[0..3].copy_from_slice(b"TAG");
        file.extend_from_slice(&tag);
        assert_eq!(strip_id3v1(&file), audio);
    }

    #[test]
    fn strips_doubled_trailing_id3v1() {
        let audio = b"raw-flac-frames";
        let mut tag = vec![0u8; ID3V1_TAG_SIZE];
        tag[0..3].copy_from_slice(b"TAG");
        let mut file = audio.to_vec();
        file.extend_from_slice(&tag);
        file.extend_from_slice(&tag);

        let after_first = strip_id3v1(&file);
        assert_ne!(after_first, audio);
        let after_second = strip_id3v1(after_first);
        assert_eq!(after_second, audio);
    }
}
