use quick_xml::Reader;
use quick_xml::events::Event;

use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::Segment;

/// NZB 文档中的一个文件声明。
///
/// `segments` 已按 `number` 升序排好；每个分段携带整文件的组提示。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbFile {
    pub subject: String,
    pub date: Option<i64>,
    pub groups: Vec<String>,
    pub segments: Vec<Segment>,
}

/// 解析后的 NZB 文档。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NzbDocument {
    pub name: Option<String>,
    pub password: Option<String>,
    pub files: Vec<NzbFile>,
}

impl NzbDocument {
    /// 文档声明的最大发布时间戳，作为整个释出的发布日期。
    pub fn release_date(&self) -> Option<i64> {
        self.files.iter().filter_map(|file| file.date).max()
    }
}

/// `nzblnk:?t=<title>&h=<header>&g=<group>&p=<password>` 的解析结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbLink {
    pub title: String,
    pub header: String,
    pub group: Option<String>,
    pub password: Option<String>,
}

/// 判断队列行的来源路径是否为 NZBLNK 链接。
pub fn is_nzblnk(path: &str) -> bool {
    path.starts_with("nzblnk:")
}

/// 解析 NZBLNK 链接。
pub fn parse_nzblnk(link: &str) -> Result<NzbLink> {
    let url = url::Url::parse(link)
        .map_err(|err| malformed(format!("invalid nzblnk: {err}")))?;
    if url.scheme() != "nzblnk" {
        return Err(malformed(format!("unexpected scheme {}", url.scheme())));
    }
    let mut title = None;
    let mut header = None;
    let mut group = None;
    let mut password = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "t" => title = Some(value.into_owned()),
            "h" => header = Some(value.into_owned()),
            "g" => group = Some(value.into_owned()),
            "p" => password = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(NzbLink {
        title: title.ok_or_else(|| malformed("nzblnk without t parameter".into()))?,
        header: header.ok_or_else(|| malformed("nzblnk without h parameter".into()))?,
        group,
        password,
    })
}

/// 解析 NZB 文档。
///
/// # 契约说明（What）
/// - 要求顶层 `nzb` 元素与至少一个带分段的 `file` 子元素；
/// - 分段按 `number` 升序整理；组提示复制到每个分段；
/// - `head/meta` 里的 `name`/`password` 元数据一并带出；
/// - 任何结构破损映射为 `import.malformed_nzb`。
pub fn parse_nzb(bytes: &[u8]) -> Result<NzbDocument> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut document = NzbDocument::default();
    let mut saw_nzb_root = false;

    let mut current_file: Option<FileBuilder> = None;
    let mut in_group = false;
    let mut current_segment: Option<SegmentBuilder> = None;
    let mut meta_kind: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.local_name().as_ref() {
                b"nzb" => saw_nzb_root = true,
                b"file" => {
                    let mut builder = FileBuilder::default();
                    for attr in start.attributes().flatten() {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| malformed(format!("bad attribute: {err}")))?;
                        match attr.key.local_name().as_ref() {
                            b"subject" => builder.subject = value.into_owned(),
                            b"date" => builder.date = value.parse().ok(),
                            _ => {}
                        }
                    }
                    current_file = Some(builder);
                }
                b"group" => in_group = true,
                b"segment" => {
                    let mut builder = SegmentBuilder::default();
                    for attr in start.attributes().flatten() {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| malformed(format!("bad attribute: {err}")))?;
                        match attr.key.local_name().as_ref() {
                            b"bytes" => builder.bytes = value.parse().unwrap_or(0),
                            b"number" => builder.number = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_segment = Some(builder);
                }
                b"meta" => {
                    for attr in start.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"type" {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| malformed(format!("bad attribute: {err}")))?;
                            meta_kind = Some(value.into_owned());
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(text)) => {
                let value = text
                    .decode()
                    .map_err(|err| malformed(format!("bad text node: {err}")))?;
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                if in_group {
                    if let Some(file) = current_file.as_mut() {
                        file.groups.push(value.to_string());
                    }
                } else if let Some(segment) = current_segment.as_mut() {
                    segment.id.push_str(value);
                } else if let Some(kind) = meta_kind.as_deref() {
                    match kind {
                        "name" => document.name = Some(value.to_string()),
                        "password" => document.password = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(end)) => match end.local_name().as_ref() {
                b"file" => {
                    if let Some(builder) = current_file.take() {
                        document.files.push(builder.finish()?);
                    }
                }
                b"group" => in_group = false,
                b"segment" => {
                    if let (Some(file), Some(segment)) =
                        (current_file.as_mut(), current_segment.take())
                    {
                        file.raw_segments.push(segment);
                    }
                }
                b"meta" => meta_kind = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(malformed(format!("xml parse error: {err}"))),
        }
    }

    if !saw_nzb_root {
        return Err(malformed("document without top-level nzb element".into()));
    }
    if document.files.is_empty() {
        return Err(malformed("nzb declares no files".into()));
    }
    Ok(document)
}

#[derive(Default)]
struct FileBuilder {
    subject: String,
    date: Option<i64>,
    groups: Vec<String>,
    raw_segments: Vec<SegmentBuilder>,
}

#[derive(Default)]
struct SegmentBuilder {
    bytes: u64,
    number: u32,
    id: String,
}

impl FileBuilder {
    fn finish(mut self) -> Result<NzbFile> {
        if self.raw_segments.is_empty() {
            return Err(malformed(format!(
                "file {:?} declares no segments",
                self.subject
            )));
        }
        self.raw_segments.sort_by_key(|segment| segment.number);
        let groups = self.groups;
        let segments = self
            .raw_segments
            .into_iter()
            .map(|raw| {
                if raw.id.is_empty() {
                    return Err(malformed(format!(
                        "segment {} of {:?} has no message id",
                        raw.number, self.subject
                    )));
                }
                Ok(Segment {
                    id: raw.id,
                    bytes: raw.bytes,
                    groups: groups.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(NzbFile {
            subject: self.subject,
            date: self.date,
            groups,
            segments,
        })
    }
}

fn malformed(message: String) -> CoreError {
    CoreError::new(codes::MALFORMED_NZB, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="name">Example.Release.2024</meta>
    <meta type="password">s3cret</meta>
  </head>
  <file poster="poster@example" date="1699000000" subject="[1/3] &quot;movie.mkv&quot; yEnc (1/3)">
    <groups>
      <group>alt.binaries.example</group>
      <group>alt.binaries.misc</group>
    </groups>
    <segments>
      <segment bytes="716800" number="2">part2@news.example</segment>
      <segment bytes="716800" number="1">part1@news.example</segment>
      <segment bytes="716800" number="3">part3@news.example</segment>
    </segments>
  </file>
</nzb>"#;

    #[test]
    fn parses_files_groups_and_ordered_segments() {
        let doc = parse_nzb(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(doc.name.as_deref(), Some("Example.Release.2024"));
        assert_eq!(doc.password.as_deref(), Some("s3cret"));
        assert_eq!(doc.files.len(), 1);

        let file = &doc.files[0];
        assert_eq!(file.date, Some(1_699_000_000));
        assert_eq!(file.groups.len(), 2);
        let ids: Vec<&str> = file.segments.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["part1@news.example", "part2@news.example", "part3@news.example"]
        );
        assert!(file.segments.iter().all(|s| s.bytes == 716_800));
        assert_eq!(file.segments[0].groups, file.groups);
        assert_eq!(doc.release_date(), Some(1_699_000_000));
    }

    #[test]
    fn rejects_document_without_files() {
        let err = parse_nzb(b"<nzb></nzb>").unwrap_err();
        assert_eq!(err.code(), codes::MALFORMED_NZB);
    }

    #[test]
    fn rejects_file_without_segments() {
        let text = r#"<nzb><file subject="x"><groups><group>g</group></groups><segments></segments></file></nzb>"#;
        assert!(parse_nzb(text.as_bytes()).is_err());
    }

    #[test]
    fn rejects_non_xml() {
        assert!(parse_nzb(b"definitely not xml <<<").is_err());
    }

    #[test]
    fn nzblnk_roundtrip() {
        let link = parse_nzblnk("nzblnk:?t=Example+Release&h=abcdef&g=alt.binaries.example&p=pw")
            .expect("parse");
        assert_eq!(link.title, "Example Release");
        assert_eq!(link.header, "abcdef");
        assert_eq!(link.group.as_deref(), Some("alt.binaries.example"));
        assert_eq!(link.password.as_deref(), Some("pw"));
        assert!(is_nzblnk("nzblnk:?t=x&h=y"));
        assert!(!is_nzblnk("/srv/watch/a.nzb"));
    }

    #[test]
    fn nzblnk_requires_title_and_header() {
        assert!(parse_nzblnk("nzblnk:?t=only-title").is_err());
        assert!(parse_nzblnk("nzblnk:?h=only-header").is_err());
    }
}
