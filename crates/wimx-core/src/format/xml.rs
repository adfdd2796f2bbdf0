use std::fs::File;
use std::io::{Seek, Write};

use crate::error::WimError;
use crate::types::{ImageSelect, ResourceFlags, ResourceRecord, Result};

/// Archive-level metadata carried in the XML block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WimInfo {
    pub total_bytes: u64,
    pub images: Vec<ImageInfo>,
}

/// Per-image metadata carried in the XML block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// 1-based image index.
    pub index: u32,
    pub name: String,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Writes the XML data block at the current position.
///
/// The document is UTF-16LE with a byte-order mark, matching what existing
/// consumers of the format expect. A single-image selection re-indexes that
/// image to 1. When `total_bytes_override` is non-zero it is stored instead
/// of `info.total_bytes`; in-place appends use that to keep the previous
/// total when the lookup table is not rewritten.
pub fn write_xml_data(
    info: &WimInfo,
    image: ImageSelect,
    out: &mut File,
    total_bytes_override: u64,
) -> Result<ResourceRecord> {
    let offset = out
        .stream_position()
        .map_err(WimError::Write)?;

    let total_bytes = if total_bytes_override != 0 {
        total_bytes_override
    } else {
        info.total_bytes
    };

    let mut doc = String::new();
    doc.push_str("<WIM>");
    doc.push_str(&format!("<TOTALBYTES>{total_bytes}</TOTALBYTES>"));
    for image_info in selected_images(info, image) {
        doc.push_str(&format!(
            "<IMAGE INDEX=\"{}\"><NAME>{}</NAME><DIRCOUNT>{}</DIRCOUNT>\
             <FILECOUNT>{}</FILECOUNT><TOTALBYTES>{}</TOTALBYTES></IMAGE>",
            image_info.index,
            escape(&image_info.name),
            image_info.dir_count,
            image_info.file_count,
            image_info.total_bytes,
        ));
    }
    doc.push_str("</WIM>");

    let mut bytes = Vec::with_capacity(2 + doc.len() * 2);
    bytes.extend_from_slice(&0xFEFF_u16.to_le_bytes());
    for unit in doc.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    out.write_all(&bytes).map_err(WimError::Write)?;

    Ok(ResourceRecord {
        offset,
        size: bytes.len() as u64,
        original_size: bytes.len() as u64,
        flags: ResourceFlags::empty(),
    })
}

fn selected_images(info: &WimInfo, image: ImageSelect) -> Vec<ImageInfo> {
    match image {
        ImageSelect::All => info.images.clone(),
        ImageSelect::Index(index) => info
            .images
            .iter()
            .find(|image_info| image_info.index == index)
            .map(|image_info| {
                let mut single = image_info.clone();
                single.index = 1;
                vec![single]
            })
            .unwrap_or_default(),
    }
}

/// Parses an XML data block produced by [`write_xml_data`]. Unknown tags are
/// ignored; missing numeric fields read as zero.
pub fn parse_xml_data(bytes: &[u8]) -> Result<WimInfo> {
    if bytes.len() % 2 != 0 {
        return Err(WimError::InvalidFormat("xml data has odd length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let units = match units.first() {
        Some(&0xFEFF) => &units[1..],
        _ => &units[..],
    };
    let doc = String::from_utf16(units)
        .map_err(|_| WimError::InvalidFormat("xml data is not valid UTF-16"))?;

    let mut info = WimInfo::default();
    let body_end = doc.find("<IMAGE").unwrap_or(doc.len());
    info.total_bytes = tag_value(&doc[..body_end], "TOTALBYTES")
        .and_then(|text| text.parse().ok())
        .unwrap_or(0);

    let mut rest = &doc[..];
    let mut fallback_index = 0u32;
    while let Some(start) = rest.find("<IMAGE") {
        let block_start = &rest[start..];
        let Some(end) = block_start.find("</IMAGE>") else {
            break;
        };
        let block = &block_start[..end];
        fallback_index += 1;

        let index = attr_value(block, "INDEX")
            .and_then(|text| text.parse().ok())
            .unwrap_or(fallback_index);
        info.images.push(ImageInfo {
            index,
            name: tag_value(block, "NAME").map(unescape).unwrap_or_default(),
            dir_count: tag_value(block, "DIRCOUNT")
                .and_then(|text| text.parse().ok())
                .unwrap_or(0),
            file_count: tag_value(block, "FILECOUNT")
                .and_then(|text| text.parse().ok())
                .unwrap_or(0),
            total_bytes: tag_value(block, "TOTALBYTES")
                .and_then(|text| text.parse().ok())
                .unwrap_or(0),
        });

        rest = &block_start[end + "</IMAGE>".len()..];
    }

    Ok(info)
}

fn tag_value<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = doc.find(&open)? + open.len();
    let end = doc[start..].find(&close)? + start;
    Some(&doc[start..end])
}

fn attr_value<'a>(block: &'a str, attr: &str) -> Option<&'a str> {
    let marker = format!("{attr}=\"");
    let start = block.find(&marker)? + marker.len();
    let end = block[start..].find('"')? + start;
    Some(&block[start..end])
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(doc: &str) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in doc.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parses_multi_image_documents() {
        let doc = "<WIM><TOTALBYTES>12345</TOTALBYTES>\
                   <IMAGE INDEX=\"1\"><NAME>base</NAME><DIRCOUNT>2</DIRCOUNT>\
                   <FILECOUNT>9</FILECOUNT><TOTALBYTES>100</TOTALBYTES></IMAGE>\
                   <IMAGE INDEX=\"2\"><NAME>patch &amp; fixes</NAME></IMAGE></WIM>";
        let info = parse_xml_data(&encode(doc)).unwrap();
        assert_eq!(info.total_bytes, 12345);
        assert_eq!(info.images.len(), 2);
        assert_eq!(info.images[0].file_count, 9);
        assert_eq!(info.images[1].name, "patch & fixes");
        assert_eq!(info.images[1].dir_count, 0);
    }

    #[test]
    fn rejects_malformed_encodings() {
        assert!(parse_xml_data(&[0x00]).is_err());
        let lone_surrogate = 0xD800_u16.to_le_bytes();
        assert!(parse_xml_data(&lone_surrogate).is_err());
    }

    #[test]
    fn name_escaping_round_trips() {
        assert_eq!(unescape(&escape("a <b> & c")), "a <b> & c");
    }
}
