mod citation;
mod index;
mod kanji;
mod resolver;
mod splice;
mod tree;
mod trie;

use anyhow::{Context, Result, anyhow};
use citation::CitationGrammar;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use index::StatuteIndex;
use resolver::Resolver;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::{StreamExt, wrappers::ReadDirStream};
use tracing::{error, info};
use tree::Document;

#[derive(Clone, Parser)]
struct Arg {
  /// 法令XMLを集めたディレクトリ
  #[clap(default_value = "all_xml")]
  corpus: PathBuf,
  /// 法令一覧CSV
  #[clap(long, default_value = "all_xml/all_law_list.csv")]
  law_list: PathBuf,
  /// 略称一覧CSV
  #[clap(long, default_value = "short_law_names.csv")]
  short_names: PathBuf,
  /// 出力先ディレクトリ
  #[clap(short, long, default_value = "linked")]
  output: PathBuf,
  #[clap(short, long, default_value_t = 2)]
  /// jobs
  jobs: usize,
  /// 実行結果の集計を書き出すJSONファイル
  #[clap(long)]
  stats: Option<PathBuf>,
  #[clap(flatten)]
  verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct RunStats {
  documents: usize,
  skipped: usize,
  links: usize,
}

enum Outcome {
  Written { links: usize },
  Skipped,
}

fn main() -> Result<()> {
  let args = Arg::parse();
  tracing_subscriber::fmt()
    .with_max_level(args.verbosity.tracing_level_filter())
    .with_writer(std::io::stderr)
    .init();
  let threds = args.jobs;
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(threds)
    .enable_all()
    .build()?
    .block_on(run(args))
}

async fn run(args: Arg) -> Result<()> {
  let index = Arc::new(StatuteIndex::load(&args.law_list, &args.short_names)?);
  let grammar = Arc::new(CitationGrammar::new());

  let mut xml_files = collect_xml_files(&args.corpus).await?;
  xml_files.sort();
  let total = xml_files.len();
  info!("{total}件の法令XMLを処理します");

  let mut handles = Vec::new();
  for (file_no, path) in xml_files.into_iter().enumerate() {
    let index = Arc::clone(&index);
    let grammar = Arc::clone(&grammar);
    let corpus = args.corpus.clone();
    let output = args.output.clone();
    let handle = tokio::spawn(async move {
      process_document(&index, &grammar, &path, &corpus, &output, file_no, total)
        .map_err(|e| (path, e))
    });
    handles.push(handle);
  }

  let mut stats = RunStats::default();
  for handle in handles {
    match handle.await {
      Ok(Ok(Outcome::Written { links })) => {
        stats.documents += 1;
        stats.links += links;
      }
      Ok(Ok(Outcome::Skipped)) => stats.skipped += 1,
      Ok(Err((path, e))) => error!("{}の処理に失敗しました: {e:#}", path.display()),
      Err(e) => error!("処理タスクが異常終了しました: {e}"),
    }
  }

  info!(
    "処理{}件，スキップ{}件，リンク{}件",
    stats.documents, stats.skipped, stats.links
  );
  if let Some(stats_path) = &args.stats {
    std::fs::write(stats_path, serde_json::to_string_pretty(&stats)?)
      .with_context(|| format!("集計を書き出せません: {}", stats_path.display()))?;
  }
  Ok(())
}

/// corpus以下の*.xmlを再帰的に集める
async fn collect_xml_files(corpus: &Path) -> Result<Vec<PathBuf>> {
  let mut result = Vec::new();
  let mut pending = vec![corpus.to_path_buf()];
  while let Some(dir) = pending.pop() {
    let read_dir = tokio::fs::read_dir(&dir)
      .await
      .with_context(|| format!("ディレクトリを読めません: {}", dir.display()))?;
    let mut entries = ReadDirStream::new(read_dir);
    while let Some(entry) = entries.next().await {
      let entry = entry?;
      let path = entry.path();
      if entry.file_type().await?.is_dir() {
        pending.push(path);
      } else if path.extension().is_some_and(|ext| ext == "xml") {
        result.push(path);
      }
    }
  }
  Ok(result)
}

/// 一つの文書の解決と挿入を行い，結果を鏡写しのパスに書き出す
fn process_document(
  index: &StatuteIndex,
  grammar: &CitationGrammar,
  path: &Path,
  corpus: &Path,
  output: &Path,
  file_no: usize,
  total: usize,
) -> Result<Outcome> {
  info!("{}/{} {}", file_no + 1, total, path.display());

  let relative = path.strip_prefix(corpus).unwrap_or(path);
  let output_path = output.join(relative);
  // 出力済みの文書は処理しない．中断後の再開をそのまま可能にする
  if output_path.is_file() {
    return Ok(Outcome::Skipped);
  }

  let xml = std::fs::read_to_string(path)
    .with_context(|| format!("文書を読めません: {}", path.display()))?;
  let mut doc = Document::parse_str(&xml)
    .with_context(|| format!("XMLを解析できません: {}", path.display()))?;

  let mut resolver = Resolver::new(index, grammar, self_law_id(path)?);
  let mut links = 0;
  for sentence in doc.descendants_by_name(doc.root(), "Sentence") {
    let link_list = resolver.resolve_sentence(&doc, sentence);
    links += link_list.iter().filter(|l| l.law.is_some()).count();
    splice::splice_sentence(&mut doc, sentence, &link_list)?;
  }

  if let Some(parent) = output_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&output_path, doc.to_xml_string()?)
    .with_context(|| format!("書き出せません: {}", output_path.display()))?;
  info!("書き出しました: {}", output_path.display());
  Ok(Outcome::Written { links })
}

/// ファイル名の先頭（最初の_まで）が文書自身の法令ID
fn self_law_id(path: &Path) -> Result<String> {
  let stem = path
    .file_stem()
    .and_then(|s| s.to_str())
    .ok_or_else(|| anyhow!("ファイル名が不正です: {}", path.display()))?;
  Ok(stem.split('_').next().unwrap_or(stem).to_string())
}

#[test]
fn check_self_law_id() {
  let path = Path::new("all_xml/129/129AC0000000089_20230401_505AC0000000053.xml");
  assert_eq!(self_law_id(path).unwrap(), "129AC0000000089");
  let path = Path::new("129AC0000000089.xml");
  assert_eq!(self_law_id(path).unwrap(), "129AC0000000089");
}
