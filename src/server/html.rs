//! Minimal HTML pages: PEP 503 indexes, the landing page and status views.

use crate::models::Link;
use std::fmt::Write;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <meta name=\"pypi:repository-version\" content=\"1.0\">\n    <title>{}</title>\n  </head>\n  <body>\n{}  </body>\n</html>\n",
        escape(title),
        body
    )
}

/// Root simple index: one anchor per known project.
pub fn simple_index(projects: &[String]) -> String {
    let mut body = String::from("    <h1>Simple index</h1>\n");
    for name in projects {
        let name = escape(name);
        let _ = writeln!(body, "    <a href=\"{name}/\">{name}</a><br/>");
    }
    page("Simple index", &body)
}

/// Per-project page listing proxied artifact links.
pub fn project_page(project: &str, links: &[Link]) -> String {
    let title = format!("Links for {project}");
    let mut body = format!("    <h1>{}</h1>\n", escape(&title));
    for link in links {
        let _ = writeln!(
            body,
            "    <a href=\"{}\">{}</a><br/>",
            escape(&link.href),
            escape(&link.label)
        );
    }
    page(&title, &body)
}

pub fn landing(version: &str, uptime: &str, projects: usize, offline: bool) -> String {
    let body = format!(
        "    <h1>offgrid {}</h1>\n    <p>Up for {}. {} project(s) indexed. Offline mode is {}.</p>\n    <p><a href=\"/simple/\">Simple index</a></p>\n",
        escape(version),
        escape(uptime),
        projects,
        if offline { "on" } else { "off" }
    );
    page("offgrid", &body)
}

/// Two-column table of server facts.
pub fn settings(rows: &[(&str, String)]) -> String {
    let mut body = String::from("    <h1>Server settings</h1>\n    <table>\n");
    for (name, value) in rows {
        let _ = writeln!(
            body,
            "      <tr><th>{}</th><td>{}</td></tr>",
            escape(name),
            escape(value)
        );
    }
    body.push_str("    </table>\n");
    page("Server settings", &body)
}

/// Entry point for browsing cache status per project.
pub fn cache_status_index(projects: &[String]) -> String {
    let mut body = String::from("    <h1>Cache status</h1>\n    <ul>\n");
    for name in projects {
        let name = escape(name);
        let _ = writeln!(
            body,
            "      <li>{name}: <a href=\"/cache_status/{name}/\">metadata</a>, <a href=\"/cache_status/project_files/{name}/\">files</a></li>"
        );
    }
    body.push_str("    </ul>\n");
    page("Cache status", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#x27;");
    }

    #[test]
    fn project_page_lists_links_in_order() {
        let html = project_page(
            "demo",
            &[
                Link::new("demo-1.0.tar.gz", "http://proxy/download_file/t/demo-1.0.tar.gz#sha256=1"),
                Link::new("demo-1.1.tar.gz", "http://proxy/download_file/t/demo-1.1.tar.gz"),
            ],
        );
        assert!(html.contains("<title>Links for demo</title>"));
        let first = html.find("demo-1.0.tar.gz</a>").unwrap();
        let second = html.find("demo-1.1.tar.gz</a>").unwrap();
        assert!(first < second);
        assert!(html.contains("href=\"http://proxy/download_file/t/demo-1.0.tar.gz#sha256=1\""));
    }

    #[test]
    fn simple_index_links_are_relative() {
        let html = simple_index(&["alpha".to_string(), "beta".to_string()]);
        assert!(html.contains("<a href=\"alpha/\">alpha</a>"));
        assert!(html.contains("<a href=\"beta/\">beta</a>"));
    }

    #[test]
    fn settings_rows_are_escaped() {
        let html = settings(&[("Proxy server base URL", "http://proxy/?a=1&b=2".to_string())]);
        assert!(html.contains("<th>Proxy server base URL</th><td>http://proxy/?a=1&amp;b=2</td>"));
    }

    #[test]
    fn cache_status_index_links_both_views() {
        let html = cache_status_index(&["demo".to_string()]);
        assert!(html.contains("href=\"/cache_status/demo/\""));
        assert!(html.contains("href=\"/cache_status/project_files/demo/\""));
    }
}
