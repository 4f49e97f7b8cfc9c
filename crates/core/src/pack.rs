//! Packing extracted pages into the target container.
//!
//! Every output is first written to a temp file in the output directory and
//! then renamed into place, so a failed or canceled job never leaves a
//! partial file under the final name. Existing outputs are never replaced:
//! the new file gets a ` (n)` suffix instead.

use crate::backend::folder::list_images;
use crate::config::{ConversionOptions, OutputFormat, PdfDpiMethod};
use crate::detect::mime_from_name;
use crate::error::{ComicError, Result};
use lopdf::{dictionary, Document, Object, Stream};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Fallback page density when an image carries none.
pub const DEFAULT_PDF_DPI: f32 = 300.0;

/// Page images below `root` in natural order.
pub fn collect_pages(root: &Path) -> Result<Vec<PathBuf>> {
    list_images(root, usize::MAX)
}

/// `dir/stem.ext`, or `dir/stem (n).ext` for the first free `n`.
pub fn unique_output_path(dir: &Path, stem: &str, extension: Option<&str>) -> PathBuf {
    let name = |suffix: String| match extension {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", stem, suffix),
    };
    let mut candidate = dir.join(name(String::new()));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(name(format!(" ({})", n)));
        n += 1;
    }
    candidate
}

/// Pack `pages` (all below `root`) into `output_dir`, named after `stem`.
pub fn pack(
    pages: &[PathBuf],
    root: &Path,
    output_dir: &Path,
    stem: &str,
    options: &ConversionOptions,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let target = unique_output_path(output_dir, stem, options.output_format.extension());
    debug!("Packing {} pages into {:?}", pages.len(), target);

    match options.output_format {
        OutputFormat::Folder => copy_folder(pages, root, &target)?,
        OutputFormat::Cbz => write_atomically(output_dir, &target, |w| write_cbz(pages, root, w))?,
        OutputFormat::Pdf => {
            write_atomically(output_dir, &target, |w| write_pdf(pages, options.pdf_dpi, stem, w))?
        }
        OutputFormat::Epub => write_atomically(output_dir, &target, |w| write_epub(pages, stem, w))?,
    }
    Ok(target)
}

/// Write through a temp file in `dir`, then move it to `target`.
fn write_atomically<F>(dir: &Path, target: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
{
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.persist_noclobber(target)
        .map_err(|e| ComicError::conversion(target, e.error))?;
    Ok(())
}

fn relative_name(page: &Path, root: &Path) -> String {
    let relative = page.strip_prefix(root).unwrap_or(page);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn copy_folder(pages: &[PathBuf], root: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    for page in pages {
        let dest = target.join(relative_name(page, root));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(page, &dest)?;
    }
    Ok(())
}

/// CBZ: the pages, stored uncompressed, under their relative paths.
fn write_cbz<W: Write + std::io::Seek>(pages: &[PathBuf], root: &Path, writer: W) -> Result<()> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for page in pages {
        zip.start_file(relative_name(page, root), options)
            .map_err(|e| ComicError::conversion(page, e))?;
        std::io::copy(&mut File::open(page)?, &mut zip)?;
    }
    zip.finish().map_err(|e| ComicError::conversion(root, e))?;
    Ok(())
}

/// Header facts of a baseline or progressive JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    /// JFIF density as `(unit, x, y)`: unit 1 is per inch, 2 per centimeter.
    pub density: Option<(u8, u16, u16)>,
}

/// Walk JPEG markers up to the first frame header.
pub fn jpeg_info(data: &[u8]) -> Option<JpegInfo> {
    if data.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut density = None;
    let mut at = 2;
    while at + 4 <= data.len() {
        if data[at] != 0xFF {
            return None;
        }
        let marker = data[at + 1];
        if marker == 0xFF {
            at += 1;
            continue;
        }
        let length = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
        let segment = data.get(at + 4..at + 2 + length)?;
        match marker {
            0xE0 if segment.starts_with(b"JFIF\0") && segment.len() >= 12 => {
                let unit = segment[7];
                let x = u16::from_be_bytes([segment[8], segment[9]]);
                let y = u16::from_be_bytes([segment[10], segment[11]]);
                density = Some((unit, x, y));
            }
            0xC0..=0xCF if marker != 0xC4 && marker != 0xC8 && marker != 0xCC => {
                if segment.len() < 6 {
                    return None;
                }
                return Some(JpegInfo {
                    height: u16::from_be_bytes([segment[1], segment[2]]) as u32,
                    width: u16::from_be_bytes([segment[3], segment[4]]) as u32,
                    components: segment[5],
                    density,
                });
            }
            _ => {}
        }
        at += 2 + length;
    }
    None
}

/// Page density for a JPEG under `method`.
pub fn page_dpi(info: &JpegInfo, method: PdfDpiMethod) -> f32 {
    match method {
        PdfDpiMethod::Fixed300 => 300.0,
        PdfDpiMethod::Fixed72 => 72.0,
        PdfDpiMethod::Metadata => match info.density {
            Some((1, x, _)) if x > 1 => x as f32,
            Some((2, x, _)) if x > 1 => x as f32 * 2.54,
            _ => DEFAULT_PDF_DPI,
        },
    }
}

/// PDF: one JPEG image per page, page size from pixels and density.
fn write_pdf<W: Write>(
    pages: &[PathBuf],
    method: PdfDpiMethod,
    title: &str,
    writer: &mut W,
) -> Result<()> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for page in pages {
        let data = std::fs::read(page)?;
        let info = jpeg_info(&data)
            .ok_or_else(|| ComicError::conversion(page, "page is not a JPEG image"))?;
        let color_space = match info.components {
            1 => "DeviceGray",
            3 => "DeviceRGB",
            4 => "DeviceCMYK",
            n => return Err(ComicError::conversion(page, format!("{} color components", n))),
        };

        let mut image_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => info.width as i64,
            "Height" => info.height as i64,
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        };
        if info.components == 4 {
            // Adobe CMYK JPEGs are stored inverted.
            let decode: Vec<Object> = [1, 0, 1, 0, 1, 0, 1, 0].iter().map(|v| (*v).into()).collect();
            image_dict.set("Decode", decode);
        }
        let image_id = doc.add_object(Stream::new(image_dict, data));

        let dpi = page_dpi(&info, method);
        let width_pt = info.width as f32 * 72.0 / dpi;
        let height_pt = info.height as f32 * 72.0 / dpi;
        let content = format!("q {:.4} 0 0 {:.4} 0 0 cm /Im0 Do Q", width_pt, height_pt);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width_pt.into(), height_pt.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages.len() as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(title),
        "Producer" => Object::string_literal("comic-core"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);
    doc.save_to(writer)
        .map_err(|e| ComicError::conversion(Path::new(title), e))?;
    Ok(())
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

struct EpubPage {
    id: String,
    image_href: String,
    xhtml_href: String,
    media_type: &'static str,
    width: u32,
    height: u32,
}

fn page_xhtml(title: &str, page: &EpubPage) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <title>{title}</title>
  <meta name="viewport" content="width={w}, height={h}"/>
  <style>body {{ margin: 0; }} img {{ width: 100%; height: 100%; }}</style>
</head>
<body>
  <img src="{src}" alt=""/>
</body>
</html>
"#,
        title = title,
        w = page.width,
        h = page.height,
        src = page.image_href,
    )
}

/// EPUB 3: one XHTML page per image, with OPF and navigation document.
fn write_epub<W: Write + std::io::Seek>(pages: &[PathBuf], stem: &str, writer: W) -> Result<()> {
    let title = xml_escape(stem);
    let mut zip = ZipWriter::new(writer);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let fail = |e: zip::result::ZipError| ComicError::conversion(Path::new(stem), e);

    zip.start_file("mimetype", stored).map_err(fail)?;
    zip.write_all(b"application/epub+zip")?;
    zip.start_file("META-INF/container.xml", deflated).map_err(fail)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    let mut entries = Vec::with_capacity(pages.len());
    for (i, page) in pages.iter().enumerate() {
        let ext = page
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg")
            .to_ascii_lowercase();
        let image_name = format!("{:04}.{}", i + 1, ext);
        let media_type = mime_from_name(&image_name)
            .ok_or_else(|| ComicError::conversion(page, "unknown page image type"))?;
        let (width, height) = image::image_dimensions(page)?;
        let entry = EpubPage {
            id: format!("p{:04}", i + 1),
            image_href: format!("images/{}", image_name),
            xhtml_href: format!("page_{:04}.xhtml", i + 1),
            media_type,
            width,
            height,
        };

        zip.start_file(format!("OEBPS/{}", entry.image_href), stored)
            .map_err(fail)?;
        std::io::copy(&mut File::open(page)?, &mut zip)?;
        zip.start_file(format!("OEBPS/{}", entry.xhtml_href), deflated)
            .map_err(fail)?;
        zip.write_all(page_xhtml(&title, &entry).as_bytes())?;
        entries.push(entry);
    }

    let mut manifest = String::from(
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
"#,
    );
    let mut spine = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let cover = if i == 0 { r#" properties="cover-image""# } else { "" };
        manifest.push_str(&format!(
            "    <item id=\"img-{id}\" href=\"{href}\" media-type=\"{mt}\"{cover}/>\n",
            id = entry.id,
            href = entry.image_href,
            mt = entry.media_type,
            cover = cover,
        ));
        manifest.push_str(&format!(
            "    <item id=\"{id}\" href=\"{href}\" media-type=\"application/xhtml+xml\"/>\n",
            id = entry.id,
            href = entry.xhtml_href,
        ));
        spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", entry.id));
    }

    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">urn:uuid:{uuid}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>en</dc:language>
    <meta property="rendition:layout">pre-paginated</meta>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine>
{spine}  </spine>
</package>
"#,
        uuid = Uuid::new_v4(),
        title = title,
        manifest = manifest,
        spine = spine,
    );
    zip.start_file("OEBPS/content.opf", deflated).map_err(fail)?;
    zip.write_all(opf.as_bytes())?;

    let first = entries
        .first()
        .map(|e| e.xhtml_href.as_str())
        .unwrap_or("page_0001.xhtml");
    let nav = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>{title}</title></head>
<body>
  <nav epub:type="toc"><ol><li><a href="{first}">{title}</a></li></ol></nav>
</body>
</html>
"#,
        title = title,
        first = first,
    );
    zip.start_file("OEBPS/nav.xhtml", deflated).map_err(fail)?;
    zip.write_all(nav.as_bytes())?;

    zip.finish().map_err(fail)?;
    Ok(())
}
