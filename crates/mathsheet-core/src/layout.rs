//! Document skeletons for compile checks and full exercise sheets.
//!
//! The compile verifier and the sheet renderer share one preamble so that a
//! fragment which compiles in a probe document also compiles on the sheet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{Difficulty, GeneratedItem};

/// Supported TeX engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypesetEngine {
    /// Single pass, `luatexja` for Japanese.
    #[default]
    Lualatex,
    /// `uplatex` to DVI, then `dvipdfmx`.
    Uplatex,
}

impl TypesetEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypesetEngine::Lualatex => "lualatex",
            TypesetEngine::Uplatex => "uplatex",
        }
    }
}

impl fmt::Display for TypesetEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypesetEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lualatex" => Ok(TypesetEngine::Lualatex),
            "uplatex" => Ok(TypesetEngine::Uplatex),
            other => Err(format!(
                "unknown engine '{}', expected lualatex or uplatex",
                other
            )),
        }
    }
}

/// Where a fragment is displayed on the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileContext {
    /// Problem statement inside a question box with an empty answer area.
    Stem,
    /// Inside the filled answer box of the answer sheet.
    Answer,
}

const LUALATEX_CLASS: &str = r"\documentclass[a4paper,10pt,twocolumn]{article}
\usepackage{luatexja}
";

const UPLATEX_CLASS: &str = r"\documentclass[uplatex,dvipdfmx,a4paper,10pt,twocolumn]{ujarticle}
";

const COMMON_PREAMBLE: &str = r"\usepackage[top=10mm,bottom=10mm,left=10mm,right=10mm]{geometry}
\usepackage{amsmath,amssymb}
\usepackage{multicol}
\usepackage{needspace}
\usepackage{xcolor}
\pagestyle{empty}

\setlength{\fboxsep}{8pt}

\newsavebox{\myqbox}
\newenvironment{qbox}{%
  \begin{lrbox}{\myqbox}%
  \begin{minipage}{\dimexpr\linewidth-2\fboxsep-2\fboxrule\relax}
  \setlength{\parskip}{5pt}
}{%
  \end{minipage}%
  \end{lrbox}%
  \par\noindent
  \fbox{\usebox{\myqbox}}%
  \par\vspace{1em}
}

\newcommand{\answerbox}[2]{
  \par\vspace{0.2em}
  \noindent\textbf{答:}
  \begin{minipage}[t][#1][t]{\dimexpr\linewidth-3em\relax}
    \mbox{}
  \end{minipage}
}

\newcommand{\answeredbox}[1]{
  \par\vspace{0.2em}
  \noindent\textbf{答:}\ 
  \begin{minipage}[t]{\dimexpr\linewidth-3em\relax}
    \raggedright
    \color{red}
    \normalsize #1
  \end{minipage}
  \par
}

\newcommand{\mistakebox}[1]{
  \par\vspace{0.3em}
  \noindent{\small\textbf{よくある間違い}:\ #1}
  \par
}

\newcommand{\hintbox}[1]{
  \par\vspace{0.3em}
  \noindent{\small\textbf{ヒント}:\ #1}
  \par
}
";

const HEADER_OPEN: &str = r"\twocolumn[{
  \vspace{0.5em}
  \noindent
  \begin{minipage}[b]{0.6\linewidth}
    {\LARGE \textbf{数学演習プリント}} \\[0.4em]
    {\small \color{darkgray} \textbf{単元:} ";

const HEADER_MIDDLE: &str = r" \quad \textbf{難易度:} ";

const HEADER_CLOSE: &str = r"}
  \end{minipage}
  \hfill
  \begin{minipage}[b]{0.38\linewidth}
    \begin{flushright}
      \small
      \textbf{日付}: \underline{\hspace{2.5cm}} \quad \textbf{氏名}: \underline{\hspace{2.5cm}}
    \end{flushright}
  \end{minipage}
  \par\vspace{1em}
  \hrule height 0.5pt
  \vspace{2em}
}]
";

/// Options for a rendered exercise sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSpec {
    pub unit_titles: Vec<String>,
    pub difficulties: Vec<Difficulty>,
    /// Double the height of the empty answer area.
    pub more_work_space: bool,
    /// Append a page with explanations for the instructor.
    pub instructor_guide: bool,
    /// Closing review notes on the answer sheet.
    pub point_review: Option<String>,
}

/// Builds document sources for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SheetLayout {
    engine: TypesetEngine,
}

impl SheetLayout {
    pub fn new(engine: TypesetEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> TypesetEngine {
        self.engine
    }

    pub fn preamble(&self) -> String {
        let class = match self.engine {
            TypesetEngine::Lualatex => LUALATEX_CLASS,
            TypesetEngine::Uplatex => UPLATEX_CLASS,
        };
        format!("{}{}", class, COMMON_PREAMBLE)
    }

    /// Wrap a body in the full preamble and document environment.
    pub fn document(&self, body: &str) -> String {
        format!(
            "{}\n\\begin{{document}}\n\n{}\n\n\\end{{document}}\n",
            self.preamble(),
            body
        )
    }

    /// A one-question document placing `fragment` where it appears on the sheet.
    pub fn probe_document(&self, fragment: &str, context: CompileContext) -> String {
        let body = match context {
            CompileContext::Stem => problem_block(1, fragment, "3cm"),
            CompileContext::Answer => {
                format!(
                    "\\begin{{qbox}}\n\\textbf{{（1）}} 問題\n\\answeredbox{{{}}}\n\\end{{qbox}}\n",
                    fragment
                )
            }
        };
        self.document(&body)
    }

    /// Problem sheet, then the answer sheet on a new page, then the optional
    /// instructor guide.
    pub fn render_sheet(&self, spec: &SheetSpec, items: &[GeneratedItem]) -> String {
        let units = spec.unit_titles.join("・");
        let difficulties = spec
            .difficulties
            .iter()
            .map(|d| d.label_ja())
            .collect::<Vec<_>>()
            .join("・");

        let mut body = String::new();
        body.push_str(HEADER_OPEN);
        body.push_str(&escape_latex(&units));
        body.push_str(HEADER_MIDDLE);
        body.push_str(&escape_latex(&difficulties));
        body.push_str(HEADER_CLOSE);

        let work_height = if spec.more_work_space { "6cm" } else { "3cm" };
        for (idx, item) in items.iter().enumerate() {
            body.push_str(&problem_block(
                idx + 1,
                &normalize_display(&item.stem_text),
                work_height,
            ));
        }

        body.push_str("\n\\newpage\\section*{解答}\\vspace{1em}\n");
        for (idx, item) in items.iter().enumerate() {
            let mut block = format!(
                "\\needspace{{4cm}}\n\\begin{{qbox}}\n\\textbf{{（{}）}} {}\n\\answeredbox{{{}}}\n",
                idx + 1,
                normalize_display(&item.stem_text),
                normalize_display(&item.answer_text)
            );
            if item.has_explanation() {
                block.push_str(&format!(
                    "\\par\\vspace{{0.5em}}\\noindent{{\\small\\textbf{{解説}}:\\par {}\\par}}\n",
                    normalize_display(&item.explanation_text)
                ));
            }
            if item.has_common_mistake() {
                block.push_str(&format!(
                    "\\mistakebox{{{}}}\n",
                    normalize_display(&item.common_mistake_text)
                ));
            }
            if item.has_hint() {
                block.push_str(&format!("\\hintbox{{{}}}\n", normalize_display(&item.hint_text)));
            }
            block.push_str("\\end{qbox}\n");
            body.push_str(&block);
        }

        if let Some(review) = spec.point_review.as_deref().filter(|r| !r.trim().is_empty()) {
            body.push_str("\\par\\vspace{1em}\\section*{ポイント復習}\n");
            body.push_str(&normalize_display(review));
            body.push('\n');
        }

        if spec.instructor_guide {
            body.push_str("\n\\newpage\\section*{講師用ガイド（ヒント・指導案）}\\vspace{1em}\n");
            for (idx, item) in items.iter().enumerate() {
                let explanation = if item.has_explanation() {
                    normalize_display(&item.explanation_text)
                } else {
                    "なし".to_string()
                };
                let hints = if item.has_hint() {
                    format!(
                        "\\textbf{{学習ヒント}}:\n\\begin{{itemize}}\n\\item {}\n\\end{{itemize}}\n",
                        normalize_display(&item.hint_text)
                    )
                } else {
                    String::new()
                };
                body.push_str(&format!(
                    "\\needspace{{5cm}}\n\\begin{{qbox}}\n\\textbf{{（{}）}} {}\n\\par\\vspace{{0.5em}}\n{}\\textbf{{解説}}:\\par {}\n\\end{{qbox}}\n",
                    idx + 1,
                    normalize_display(&item.stem_text),
                    hints,
                    explanation
                ));
            }
        }

        self.document(&body)
    }
}

fn problem_block(number: usize, stem: &str, work_height: &str) -> String {
    format!(
        "\\needspace{{4cm}}\n\\begin{{qbox}}\n\\textbf{{（{}）}} {}\n\\answerbox{{{}}}{{}}\n\\end{{qbox}}\n",
        number, stem, work_height
    )
}

/// Escape plain text (titles, labels) for use inside a LaTeX document.
pub fn escape_latex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' | '%' | '$' | '#' | '_' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '~' => out.push_str("\\textasciitilde{}"),
            '^' => out.push_str("\\textasciicircum{}"),
            '\\' => out.push_str("\\textbackslash{}"),
            _ => out.push(c),
        }
    }
    out
}

/// Normalize generated markup for display on the sheet.
///
/// Literal `\n` sequences become newlines (control words such as `\neq` are
/// left alone), and a `$...$` wrapper around a `\[...\]` block is removed.
pub fn normalize_display(text: &str) -> String {
    let trimmed = text.trim();
    let mut cleaned = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'n') {
            let mut lookahead = chars.clone();
            lookahead.next();
            if !lookahead.peek().is_some_and(|n| n.is_ascii_alphabetic()) {
                chars.next();
                cleaned.push('\n');
                continue;
            }
        }
        cleaned.push(c);
    }

    if cleaned.len() >= 2 && cleaned.starts_with('$') && cleaned.ends_with('$') {
        let inner = cleaned[1..cleaned.len() - 1].trim();
        if inner.contains("\\[") && inner.contains("\\]") {
            return inner.to_string();
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_parse() {
        assert_eq!("upLaTeX".parse::<TypesetEngine>().unwrap(), TypesetEngine::Uplatex);
        assert!("pdflatex".parse::<TypesetEngine>().is_err());
        assert_eq!(TypesetEngine::default(), TypesetEngine::Lualatex);
    }

    #[test]
    fn test_preamble_per_engine() {
        let lua = SheetLayout::new(TypesetEngine::Lualatex).preamble();
        assert!(lua.contains("luatexja"));
        assert!(lua.contains("\\newenvironment{qbox}"));

        let up = SheetLayout::new(TypesetEngine::Uplatex).preamble();
        assert!(up.contains("{ujarticle}"));
        assert!(!up.contains("luatexja"));
    }

    #[test]
    fn test_stem_probe_uses_problem_box() {
        let doc = SheetLayout::default().probe_document("$x^2$ を求めよ。", CompileContext::Stem);
        assert!(doc.contains("\\begin{qbox}"));
        assert!(doc.contains("$x^2$ を求めよ。"));
        assert!(doc.contains("\\answerbox{3cm}{}"));
        assert!(doc.trim_end().ends_with("\\end{document}"));
    }

    #[test]
    fn test_answer_probe_uses_filled_box() {
        let doc = SheetLayout::default().probe_document("$x=2$", CompileContext::Answer);
        assert!(doc.contains("\\answeredbox{$x=2$}"));
        assert!(!doc.contains("\\answerbox{3cm}"));
    }

    #[test]
    fn test_escape_latex() {
        assert_eq!(escape_latex("a_b & 100%"), "a\\_b \\& 100\\%");
        assert_eq!(escape_latex("x^2"), "x\\textasciicircum{}2");
        assert_eq!(escape_latex("\\"), "\\textbackslash{}");
    }

    #[test]
    fn test_normalize_display() {
        assert_eq!(normalize_display("a\\nb"), "a\nb");
        assert_eq!(normalize_display("$x \\neq 1$"), "$x \\neq 1$");
        assert_eq!(normalize_display(" $\\[ x^2 \\]$ "), "\\[ x^2 \\]");
        assert_eq!(normalize_display("$x$"), "$x$");
    }

    #[test]
    fn test_render_sheet_sections() {
        let items = vec![
            GeneratedItem::new("$1+1$ を計算せよ。", "$2$", Difficulty::L1)
                .with_explanation("足し算"),
            GeneratedItem::new("$2+3$ を計算せよ。", "$5$", Difficulty::L1),
        ];
        let spec = SheetSpec {
            unit_titles: vec!["数と式".to_string(), "a_b".to_string()],
            difficulties: vec![Difficulty::L1, Difficulty::L2],
            more_work_space: true,
            instructor_guide: true,
            point_review: Some("まとめ".to_string()),
        };
        let doc = SheetLayout::default().render_sheet(&spec, &items);
        assert!(doc.contains("数と式・a\\_b"));
        assert!(doc.contains("基礎・標準"));
        assert!(doc.contains("\\answerbox{6cm}{}"));
        assert!(doc.contains("\\textbf{（2）}"));
        assert!(doc.contains("\\section*{解答}"));
        assert!(doc.contains("\\answeredbox{$5$}"));
        assert!(doc.contains("ポイント復習"));
        assert!(doc.contains("講師用ガイド"));
        assert!(doc.contains("なし"));
        assert!(!doc.contains("\\hintbox{"));
    }

    #[test]
    fn test_render_sheet_feedback_boxes() {
        let mut item = GeneratedItem::new("$x^2=9$ を解け。", "$x=\\pm 3$", Difficulty::L1);
        item.hint_text = "平方根を考える".to_string();
        item.common_mistake_text = "$x=3$ だけを答える".to_string();
        let spec = SheetSpec {
            instructor_guide: true,
            ..SheetSpec::default()
        };
        let doc = SheetLayout::default().render_sheet(&spec, &[item]);

        assert!(doc.contains("\\newcommand{\\hintbox}[1]"));
        assert!(doc.contains("\\newcommand{\\mistakebox}[1]"));
        let answers = &doc[doc.find("\\section*{解答}").unwrap()..];
        let mistake = answers.find("\\mistakebox{$x=3$ だけを答える}").unwrap();
        let hint = answers.find("\\hintbox{平方根を考える}").unwrap();
        assert!(mistake < hint);
        assert!(doc.contains("\\textbf{学習ヒント}:\n\\begin{itemize}\n\\item 平方根を考える"));
    }
}
