/// Extension based MIME classification for stored files.
///
/// The table is fixed; anything unknown falls back to `text/javascript`,
/// non-binary, which is what the rest of the cluster historically expects
/// for extension-less script assets.

/// (mime type, treat as binary)
pub type MimeInfo = (&'static str, bool);

pub const DEFAULT_MIME: MimeInfo = ("text/javascript", false);

pub fn mime_for_name(name: &str) -> MimeInfo {
    let ext = name
        .rsplit('/')
        .next()
        .and_then(|base| base.rsplit_once('.').map(|(_, e)| e))
        .unwrap_or("");
    mime_for_ext(&ext.to_ascii_lowercase())
}

fn mime_for_ext(ext: &str) -> MimeInfo {
    match ext {
        "css" => ("text/css", false),
        "bmp" => ("image/bmp", true),
        "png" => ("image/png", true),
        "jpg" | "jpeg" => ("image/jpeg", true),
        "gif" => ("image/gif", true),
        "ico" => ("image/x-icon", true),
        "webp" => ("image/webp", true),
        "wbmp" => ("image/vnd.wap.wbmp", true),
        "tif" => ("image/tiff", true),
        "svg" => ("image/svg+xml", false),
        "js" => ("application/javascript", false),
        "html" | "htm" => ("text/html", false),
        "json" => ("application/json", false),
        "md" => ("text/markdown", false),
        "xml" => ("text/xml", false),
        "txt" | "log" | "csv" => ("text/plain", false),
        "ttf" => ("application/x-font-ttf", true),
        "woff" => ("application/font-woff", true),
        "woff2" => ("application/font-woff2", true),
        "eot" => ("application/vnd.ms-fontobject", true),
        "mp3" => ("audio/mpeg3", true),
        "wav" => ("audio/wav", true),
        "ogg" => ("audio/ogg", true),
        "mp4" => ("video/mp4", true),
        "avi" => ("video/avi", true),
        "webm" => ("video/webm", true),
        "doc" => ("application/msword", true),
        "docx" => ("application/vnd.openxmlformats-officedocument.wordprocessingml.document", true),
        "xls" => ("application/vnd.ms-excel", true),
        "xlsx" => ("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet", true),
        "manifest" => ("text/cache-manifest", false),
        "gz" | "gzip" => ("application/gzip", true),
        "zip" => ("application/zip", true),
        "pdf" => ("application/pdf", true),
        _ => DEFAULT_MIME,
    }
}
