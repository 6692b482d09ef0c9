//! S3 XML response rendering.
//!
//! Only the schemas this proxy's operation set actually emits
//! (`spec.md` §6): `Error`, `ListAllMyBucketsResult`, `ListBucketResult`
//! (v2), `InitiateMultipartUploadResult`, `CompleteMultipartUploadResult`,
//! `ListMultipartUploadsResult`. ACL, CopyObject, and ListObjectsV1
//! renderers from the upstream reference have no counterpart here.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

fn decl(writer: &mut Writer<Cursor<Vec<u8>>>) {
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .expect("xml decl");
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

/// Render an S3 `<Error>` XML document.
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    finish(writer)
}

/// Render `<ListAllMyBucketsResult>` for `GET /` (ListBuckets). Per
/// `spec.md` §4.4 the proxy always reports exactly one synthetic virtual
/// bucket, so `buckets` here will typically have length 1.
pub fn render_list_buckets_result(
    owner_id: &str,
    owner_display: &str,
    buckets: &[(&str, &str)],
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);

    let root = BytesStart::new("ListAllMyBucketsResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_simple_element_group(
        &mut writer,
        "Owner",
        &[("ID", owner_id), ("DisplayName", owner_display)],
    );

    writer
        .write_event(Event::Start(BytesStart::new("Buckets")))
        .expect("start Buckets");
    for (name, date) in buckets {
        write_simple_element_group(
            &mut writer,
            "Bucket",
            &[("Name", name), ("CreationDate", date)],
        );
    }
    writer
        .write_event(Event::End(BytesEnd::new("Buckets")))
        .expect("end Buckets");

    writer
        .write_event(Event::End(BytesEnd::new("ListAllMyBucketsResult")))
        .expect("end root");

    finish(writer)
}

/// A single merged object entry for ListObjectsV2 (`spec.md` §4.4).
pub struct ObjectEntry<'a> {
    pub key: &'a str,
    pub last_modified: &'a str,
    pub etag: &'a str,
    pub size: u64,
    pub storage_class: &'a str,
}

/// Render `<ListBucketResult>` for the merged ListObjectsV2 response.
#[allow(clippy::too_many_arguments)]
pub fn render_list_objects_result(
    bucket: &str,
    prefix: &str,
    max_keys: u32,
    is_truncated: bool,
    key_count: u32,
    entries: &[ObjectEntry<'_>],
    next_continuation_token: Option<&str>,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);

    let root = BytesStart::new("ListBucketResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "Name", bucket);
    write_text_element(&mut writer, "Prefix", prefix);
    write_text_element(&mut writer, "MaxKeys", &max_keys.to_string());
    write_text_element(&mut writer, "KeyCount", &key_count.to_string());
    write_text_element(
        &mut writer,
        "IsTruncated",
        if is_truncated { "true" } else { "false" },
    );
    if let Some(token) = next_continuation_token {
        write_text_element(&mut writer, "NextContinuationToken", token);
    }

    for entry in entries {
        writer
            .write_event(Event::Start(BytesStart::new("Contents")))
            .expect("start Contents");
        write_text_element(&mut writer, "Key", entry.key);
        write_text_element(&mut writer, "LastModified", entry.last_modified);
        write_text_element(&mut writer, "ETag", entry.etag);
        write_text_element(&mut writer, "Size", &entry.size.to_string());
        write_text_element(&mut writer, "StorageClass", entry.storage_class);
        writer
            .write_event(Event::End(BytesEnd::new("Contents")))
            .expect("end Contents");
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListBucketResult")))
        .expect("end root");

    finish(writer)
}

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);
    write_simple_element_group(
        &mut writer,
        "InitiateMultipartUploadResult",
        &[("Bucket", bucket), ("Key", key), ("UploadId", upload_id)],
    );
    finish(writer)
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);
    write_simple_element_group(
        &mut writer,
        "CompleteMultipartUploadResult",
        &[
            ("Location", location),
            ("Bucket", bucket),
            ("Key", key),
            ("ETag", etag),
        ],
    );
    finish(writer)
}

/// A single merged upload entry for ListMultipartUploads (`spec.md` §4.4).
pub struct UploadEntry<'a> {
    pub key: &'a str,
    pub upload_id: &'a str,
    pub initiated: &'a str,
}

/// Render `<ListMultipartUploadsResult>`. Per the Open Question
/// resolution in `SPEC_FULL.md` §9, this is always a single page:
/// `IsTruncated` is always `false`.
pub fn render_list_multipart_uploads_result(
    bucket: &str,
    entries: &[UploadEntry<'_>],
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    decl(&mut writer);

    let root = BytesStart::new("ListMultipartUploadsResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "IsTruncated", "false");

    for entry in entries {
        writer
            .write_event(Event::Start(BytesStart::new("Upload")))
            .expect("start Upload");
        write_text_element(&mut writer, "Key", entry.key);
        write_text_element(&mut writer, "UploadId", entry.upload_id);
        write_text_element(&mut writer, "Initiated", entry.initiated);
        writer
            .write_event(Event::End(BytesEnd::new("Upload")))
            .expect("end Upload");
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListMultipartUploadsResult")))
        .expect("end root");

    finish(writer)
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    parent: &str,
    children: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_renders_code_and_message() {
        let xml = render_error("NoSuchKey", "missing", "/b/k", "REQID");
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Message>missing</Message>"));
        assert!(xml.contains("<RequestId>REQID</RequestId>"));
    }

    #[test]
    fn list_objects_reports_truncation_and_token() {
        let entries = [ObjectEntry {
            key: "a",
            last_modified: "2025-01-01T00:00:00.000Z",
            etag: "\"x\"",
            size: 5,
            storage_class: "STANDARD",
        }];
        let xml = render_list_objects_result("bucket", "", 1000, true, 1, &entries, Some("TOK"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<NextContinuationToken>TOK</NextContinuationToken>"));
        assert!(xml.contains("<Key>a</Key>"));
    }

    #[test]
    fn list_multipart_uploads_is_never_truncated() {
        let xml = render_list_multipart_uploads_result("bucket", &[]);
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }
}
