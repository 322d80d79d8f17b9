//! Shared fixtures: hand-built PDFs and a small Singapore tax corpus.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taxlens::batch::BatchProcessor;
use taxlens::config::{Config, DbConfig, RemovedPolicy};
use taxlens::embedding;
use taxlens::store::sqlite::SqliteStore;

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

/// A PDF with one page per entry of `pages`, each line drawn on its own
/// baseline in Helvetica. The xref table carries real byte offsets so
/// pdf-extract accepts it.
pub fn pdf(pages: &[&[&str]]) -> Vec<u8> {
    let page_count = pages.len();
    // 1 catalog, 2 pages, 3 font, then (page, contents) pairs.
    let page_id = |i: usize| 4 + 2 * i;
    let contents_id = |i: usize| 5 + 2 * i;
    let object_count = 3 + 2 * page_count;

    let mut out = Vec::new();
    let mut offsets = vec![0usize; object_count + 1];
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets[1] = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    offsets[2] = out.len();
    let kids = (0..page_count)
        .map(|i| format!("{} 0 R", page_id(i)))
        .collect::<Vec<_>>()
        .join(" ");
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids, page_count
        )
        .as_bytes(),
    );

    offsets[3] = out.len();
    out.extend_from_slice(
        b"3 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >> endobj\n",
    );

    for (i, lines) in pages.iter().enumerate() {
        offsets[page_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >> >> endobj\n",
                page_id(i),
                contents_id(i)
            )
            .as_bytes(),
        );

        let mut stream = String::from("BT /F1 10 Tf 50 750 Td\n");
        for (n, line) in lines.iter().enumerate() {
            if n > 0 {
                stream.push_str("0 -14 Td\n");
            }
            stream.push_str(&format!("({}) Tj\n", escape(line)));
        }
        stream.push_str("ET");

        offsets[contents_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                contents_id(i),
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", object_count + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets.iter().skip(1) {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!("trailer << /Size {} /Root 1 0 R >>\nstartxref\n", object_count + 1).as_bytes(),
    );
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

pub fn write_pdf(root: &Path, rel: &str, pages: &[&[&str]]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, pdf(pages)).unwrap();
    path
}

pub const CIRCULAR_ORIGINAL: &str =
    "The concession applies to qualifying shipping enterprises operating Singapore registered ships.";
pub const CIRCULAR_REVISED: &str =
    "The concession applies to approved aircraft lessors with a qualifying leasing business.";

/// Nine readable documents covering every document type.
pub fn write_corpus(root: &Path) {
    write_pdf(
        root,
        "acts/income-tax-act.pdf",
        &[
            &[
                "INCOME TAX ACT 1947",
                "PART III",
                "CHARGE OF INCOME TAX",
                "10. Charge of income tax",
                "(1) Income tax shall be payable at the rates specified in the Second Schedule",
                "upon the income of any person accruing in or derived from Singapore.",
                "(2) In subsection (1), gains or profits include any sum received by an employee.",
                "(3) The Comptroller may by notice require any person to furnish a return.",
            ],
            &[
                "PART IV",
                "RESIDENCE",
                "11. Resident individuals",
                "(1) An individual is resident in Singapore for a year of assessment if the",
                "individual was physically present or exercised an employment in Singapore for",
                "183 days or more during the year preceding the year of assessment.",
            ],
        ],
    );
    write_pdf(
        root,
        "acts/goods-and-services-tax-act.pdf",
        &[&[
            "GOODS AND SERVICES TAX ACT 1993",
            "PART II",
            "IMPOSITION OF TAX",
            "8. Charge of tax on supplies",
            "(1) Goods and services tax shall be charged on any supply of goods or services",
            "made in Singapore where it is a taxable supply made by a taxable person.",
            "(2) A person is liable to be registered if the value of taxable supplies exceeds",
            "the threshold set out in the First Schedule.",
        ]],
    );
    write_pdf(
        root,
        "guides/gst-general-guide.pdf",
        &[&[
            "GST: General Guide for Businesses",
            "IRAS e-Tax Guide",
            "Published on 1 January 2024",
            "1 Overview of GST",
            "GST is a broad-based consumption tax levied on the import of goods and on",
            "nearly all supplies of goods and services in Singapore. The GST rate is",
            "charged on the value of standard-rated supplies made by a GST-registered business.",
            "2 Registration",
            "A business must register for GST when its taxable turnover exceeds the",
            "registration threshold over a twelve month period.",
        ]],
    );
    write_pdf(
        root,
        "guides/tax-residency-of-individuals.pdf",
        &[&[
            "Tax Residency of Individuals",
            "IRAS e-Tax Guide",
            "Last updated: 15 March 2023",
            "1 Who is a tax resident",
            "You are a tax resident for a Year of Assessment if you are a Singapore citizen",
            "or permanent resident residing in Singapore, or a foreigner who stayed or worked",
            "in Singapore for 183 days or more in the previous calendar year.",
            "2 Non-resident individuals",
            "Non-resident individuals are taxed on employment income at a flat rate or at",
            "resident rates, whichever gives the higher tax.",
        ]],
    );
    write_pdf(
        root,
        "guides/filing-your-income-tax-return.pdf",
        &[&[
            "Filing Your Income Tax Return",
            "IRAS e-Tax Guide",
            "Year of Assessment 2024",
            "1 When to file",
            "Individuals who receive a notice to file must submit their income tax return",
            "by the filing deadline each year. Late filing may attract a composition amount.",
            "2 How to file",
            "Log in to myTax Portal with Singpass to file your return electronically.",
        ]],
    );
    write_pdf(
        root,
        "guides/personal-reliefs.pdf",
        &[&[
            "Personal Reliefs and Rebates",
            "IRAS e-Tax Guide",
            "Year of Assessment 2024",
            "1 Earned income relief",
            "Earned income relief is given to recognise individuals who are working.",
            "2 Personal relief cap",
            "The total amount of personal income tax reliefs an individual can claim is",
            "subject to an overall relief cap for each Year of Assessment.",
        ]],
    );
    write_pdf(
        root,
        "circulars/circular-2023-07.pdf",
        &[&[
            "IRAS Circular No. 7 of 2023",
            "Maritime Sector Incentive",
            "Issued: 10 July 2023",
            "1 Introduction",
            CIRCULAR_ORIGINAL,
            "Qualifying income derived from the operation of ships is exempt from tax.",
        ]],
    );
    write_pdf(
        root,
        "forms/form-c-s.pdf",
        &[&[
            "Form C-S",
            "Corporate Income Tax Return",
            "Company name: ______________________",
            "Unique Entity Number: ______________",
            "Revenue for the financial year: ____________",
            "Declaration: I declare that the information given in this return is true.",
        ]],
    );
    write_pdf(
        root,
        "orders/income-tax-remission-order.pdf",
        &[&[
            "INCOME TAX (REMISSION OF TAX) ORDER 2022",
            "In exercise of the powers conferred by section 92 of the Income Tax Act 1947,",
            "the Minister for Finance makes the following Order:",
            "1. Citation and commencement",
            "This Order is the Income Tax (Remission of Tax) Order 2022 and comes into",
            "operation on 1 January 2022.",
            "2. Remission",
            "The tax payable by a qualifying charity on its rental income is remitted.",
        ]],
    );
}

pub fn write_corrupt(root: &Path) -> PathBuf {
    let path = root.join("broken/truncated.pdf");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"%PDF-1.4\n1 0 obj << /Type /Catalog truncated").unwrap();
    path
}

pub fn test_config(dir: &Path, policy: RemovedPolicy, embedding_provider: &str) -> Config {
    let mut config = Config {
        db: DbConfig {
            path: dir.join("data/taxlens.sqlite"),
        },
        ..Config::default()
    };
    config.ingest.removed_policy = policy;
    config.ingest.parse_timeout_secs = 30;
    config.embedding.provider = embedding_provider.to_string();
    config
}

pub async fn processor(config: &Config) -> (Arc<SqliteStore>, BatchProcessor) {
    let store = Arc::new(SqliteStore::open(config).await.unwrap());
    let embedder = embedding::create_provider(&config.embedding).unwrap();
    let processor = BatchProcessor::new(Arc::new(config.clone()), store.clone(), embedder);
    (store, processor)
}

pub fn facts_seed() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/facts.toml")
}
