use lopdf::{Document, Object, Stream, dictionary};

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN_X: i64 = 50;
const MARGIN_TOP: i64 = 60;
const MARGIN_BOTTOM: i64 = 60;
const FOOTER_Y: i64 = 30;
const WRAP_COLUMNS: usize = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource_name(self) -> &'static str {
        match self {
            Font::Regular => "F1",
            Font::Bold => "F2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    text: String,
    font: Font,
    size: i64,
    indent: i64,
    space_before: i64,
}

impl Line {
    fn height(&self) -> i64 {
        self.space_before + self.size + 4
    }
}

/// Flowing text layout rendered onto A4 pages with the base-14 Helvetica fonts.
///
/// Coordinates are whole points and the document carries no creation date or
/// file identifier, so identical layouts always serialize to identical bytes.
#[derive(Debug, Default)]
pub struct PdfLayout {
    lines: Vec<Line>,
}

impl PdfLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&mut self, text: &str) {
        self.push(text, Font::Bold, 16, 0, 0);
    }

    pub fn heading(&mut self, text: &str) {
        self.push(text, Font::Bold, 12, 0, 14);
    }

    pub fn paragraph(&mut self, text: &str) {
        for (i, line) in wrap(&sanitize(text), WRAP_COLUMNS).into_iter().enumerate() {
            self.push(&line, Font::Regular, 10, 0, if i == 0 { 4 } else { 0 });
        }
    }

    /// `label: value`, wrapped with continuation lines indented.
    pub fn field(&mut self, label: &str, value: &str) {
        let text = format!("{}: {}", label, value);
        for (i, line) in wrap(&sanitize(&text), WRAP_COLUMNS).into_iter().enumerate() {
            let indent = if i == 0 { 0 } else { 12 };
            self.push(&line, Font::Regular, 10, indent, 0);
        }
    }

    fn push(&mut self, text: &str, font: Font, size: i64, indent: i64, space_before: i64) {
        self.lines.push(Line {
            text: sanitize(text),
            font,
            size,
            indent,
            space_before,
        });
    }

    fn paginate(&self) -> Vec<Vec<(i64, &Line)>> {
        let mut pages = Vec::new();
        let mut current = Vec::new();
        let mut y = PAGE_HEIGHT - MARGIN_TOP;
        for line in &self.lines {
            if y - line.height() < MARGIN_BOTTOM && !current.is_empty() {
                pages.push(std::mem::take(&mut current));
                y = PAGE_HEIGHT - MARGIN_TOP;
            }
            y -= line.height();
            current.push((y, line));
        }
        if !current.is_empty() || pages.is_empty() {
            pages.push(current);
        }
        pages
    }

    fn page_content(placed: &[(i64, &Line)], page_number: usize, page_count: usize) -> Vec<u8> {
        let mut content = String::new();
        for (y, line) in placed {
            content.push_str(&format!(
                "BT /{} {} Tf {} {} Td ({}) Tj ET\n",
                line.font.resource_name(),
                line.size,
                MARGIN_X + line.indent,
                y,
                escape(&line.text)
            ));
        }
        content.push_str(&format!(
            "BT /F1 8 Tf {} {} Td (Page {} of {}) Tj ET\n",
            MARGIN_X, FOOTER_Y, page_number, page_count
        ));
        content.into_bytes()
    }

    pub fn into_pdf(self, document_title: &str) -> Result<Vec<u8>, String> {
        let mut doc = Document::with_version("1.4");
        let pages_id = doc.new_object_id();

        let regular_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let bold_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => regular_id,
                "F2" => bold_id,
            },
        });

        let pages = self.paginate();
        let page_count = pages.len();
        let mut kids: Vec<Object> = Vec::with_capacity(page_count);
        for (index, placed) in pages.iter().enumerate() {
            let content = Self::page_content(placed, index + 1, page_count);
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal(sanitize(document_title)),
            "Producer" => Object::string_literal("screening-backend"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| format!("PDF save error: {}", e))?;
        Ok(buf)
    }
}

/// Restricts text to printable ASCII; whitespace collapses to single spaces.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        let mapped = if c.is_whitespace() {
            ' '
        } else if c.is_ascii_graphic() {
            c
        } else {
            '?'
        };
        if mapped == ' ' {
            if last_space {
                continue;
            }
            last_space = true;
        } else {
            last_space = false;
        }
        out.push(mapped);
    }
    out.trim().to_string()
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '(' | ')' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Greedy word wrap; words longer than `width` are split.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let cut = word
                .char_indices()
                .nth(width)
                .map_or(word.len(), |(i, _)| i);
            let (head, tail) = word.split_at(cut);
            lines.push(head.to_string());
            word = tail;
        }
        if word.is_empty() {
            continue;
        }
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}
