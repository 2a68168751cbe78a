//! Tantivy name index for coarse candidate retrieval
//!
//! Two recall pathways over folded place names, OR-ed together:
//! trigram overlap (with transposition variants of short words) and
//! Levenshtein-automaton matches on whole words. Phrase boosts lift names
//! whose trigrams appear contiguously, and a population tweak keeps
//! prominent places ahead of hamlets with the same spelling. The index only
//! narrows the candidate set; the fuzzy matcher does the real scoring.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, PhraseQuery, Query, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::{NgramTokenizer, TextAnalyzer, TokenFilter, TokenStream, Tokenizer};
use tantivy::{DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, Term};
use thiserror::Error;

use crate::models::{PlaceId, PlaceRecord};
use crate::text;

const TRIGRAM: &str = "trigram";

/// NgramTokenizer emits every token at position 0, which defeats PhraseQuery.
/// This filter numbers tokens in order.
#[derive(Clone)]
struct IncrementPositionFilter;

impl TokenFilter for IncrementPositionFilter {
    type Tokenizer<T: Tokenizer> = IncrementPositionFilterWrapper<T>;

    fn transform<T: Tokenizer>(self, tokenizer: T) -> Self::Tokenizer<T> {
        IncrementPositionFilterWrapper(tokenizer)
    }
}

#[derive(Clone)]
struct IncrementPositionFilterWrapper<T>(T);

impl<T: Tokenizer> Tokenizer for IncrementPositionFilterWrapper<T> {
    type TokenStream<'a> = IncrementPositionTokenStream<T::TokenStream<'a>>;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        IncrementPositionTokenStream {
            inner: self.0.token_stream(text),
            position: 0,
        }
    }
}

struct IncrementPositionTokenStream<T> {
    inner: T,
    position: usize,
}

impl<T: TokenStream> TokenStream for IncrementPositionTokenStream<T> {
    fn advance(&mut self) -> bool {
        if self.inner.advance() {
            self.inner.token_mut().position = self.position;
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &tantivy::tokenizer::Token {
        self.inner.token()
    }

    fn token_mut(&mut self) -> &mut tantivy::tokenizer::Token {
        self.inner.token_mut()
    }
}

/// Error type for index operations
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("Directory error: {0}")]
    Directory(#[from] tantivy::directory::error::OpenDirectoryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexerResult<T> = Result<T, IndexerError>;

#[derive(Clone, Copy)]
struct Fields {
    id: Field,
    name: Field,
    name_words: Field,
    country: Field,
    population: Field,
}

/// Name index over place records
pub struct PlaceIndex {
    index: Index,
    writer: RwLock<IndexWriter>,
    reader: RwLock<IndexReader>,
    fields: Fields,
}

impl PlaceIndex {
    /// Open or create an index in `path`
    pub fn open(path: &Path) -> IndexerResult<Self> {
        std::fs::create_dir_all(path)?;
        let dir = MmapDirectory::open(path)?;
        let (schema, fields) = Self::build_schema();
        let index = Index::open_or_create(dir, schema)?;
        Self::from_index(index, fields, 50_000_000)
    }

    pub fn in_memory() -> IndexerResult<Self> {
        let (schema, fields) = Self::build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, fields, 15_000_000)
    }

    fn from_index(index: Index, fields: Fields, writer_budget: usize) -> IndexerResult<Self> {
        Self::register_tokenizer(&index)?;
        let writer = index.writer(writer_budget)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            writer: RwLock::new(writer),
            reader: RwLock::new(reader),
            fields,
        })
    }

    fn build_schema() -> (Schema, Fields) {
        let mut builder = Schema::builder();
        let id = builder.add_i64_field("id", STORED | FAST | INDEXED);

        let trigram_indexing = TextFieldIndexing::default()
            .set_tokenizer(TRIGRAM)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let name = builder.add_text_field(
            "name",
            TextOptions::default().set_indexing_options(trigram_indexing),
        );

        let word_indexing = TextFieldIndexing::default()
            .set_tokenizer("default")
            .set_index_option(IndexRecordOption::Basic);
        let name_words = builder.add_text_field(
            "name_words",
            TextOptions::default().set_indexing_options(word_indexing),
        );

        let country = builder.add_text_field("country", STRING);
        let population = builder.add_i64_field("population", FAST);

        let fields = Fields {
            id,
            name,
            name_words,
            country,
            population,
        };
        (builder.build(), fields)
    }

    fn register_tokenizer(index: &Index) -> IndexerResult<()> {
        let tokenizer = TextAnalyzer::builder(NgramTokenizer::new(3, 3, false)?)
            .filter(tantivy::tokenizer::LowerCaser)
            .filter(IncrementPositionFilter)
            .build();
        index.tokenizers().register(TRIGRAM, tokenizer);
        Ok(())
    }

    /// Add or replace the document for `place`. Visible after [`commit`](Self::commit).
    pub fn add_place(&self, place: &PlaceRecord) -> IndexerResult<()> {
        let writer = self.writer.read();
        writer.delete_term(Term::from_field_i64(self.fields.id, place.id.0));

        let mut doc = tantivy::TantivyDocument::default();
        doc.add_i64(self.fields.id, place.id.0);
        let folded = text::fold(&place.name);
        let folded_ascii = text::fold(&place.ascii_name);
        for variant in [&folded, &folded_ascii] {
            doc.add_text(self.fields.name, variant);
            doc.add_text(self.fields.name_words, variant);
            if folded == folded_ascii {
                break;
            }
        }
        doc.add_text(self.fields.country, &text::normalize_country(&place.country_code));
        doc.add_i64(self.fields.population, place.population.unwrap_or(0));

        writer.add_document(doc)?;
        Ok(())
    }

    pub fn commit(&self) -> IndexerResult<()> {
        self.writer.write().commit()?;
        self.reader.write().reload()?;
        Ok(())
    }

    pub fn clear(&self) -> IndexerResult<()> {
        let mut writer = self.writer.write();
        writer.delete_all_documents()?;
        writer.commit()?;
        drop(writer);
        self.reader.write().reload()?;
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.read().searcher().num_docs()
    }

    /// Whether `folded_query` is long enough for this index to recall anything.
    pub fn can_serve(folded_query: &str) -> bool {
        folded_query.chars().count() >= 3
    }

    /// Coarse retrieval: ids of up to `limit` places whose names resemble
    /// `folded_query`, optionally restricted to one country.
    pub fn search(
        &self,
        folded_query: &str,
        country: Option<&str>,
        limit: usize,
    ) -> IndexerResult<Vec<PlaceId>> {
        if !Self::can_serve(folded_query) || limit == 0 {
            return Ok(Vec::new());
        }

        let text_query = self.build_name_query(folded_query);
        let query: Box<dyn Query> = match country {
            Some(code) => {
                let country_term =
                    Term::from_field_text(self.fields.country, &text::normalize_country(code));
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, text_query),
                    (
                        Occur::Must,
                        Box::new(TermQuery::new(country_term, IndexRecordOption::Basic)),
                    ),
                ]))
            }
            None => text_query,
        };

        let reader = self.reader.read();
        let searcher = reader.searcher();

        let collector = TopDocs::with_limit(limit).tweak_score(
            move |segment_reader: &tantivy::SegmentReader| {
                let population = segment_reader.fast_fields().i64("population").ok();
                move |doc: DocId, score: Score| {
                    let pop = population
                        .as_ref()
                        .and_then(|column| column.first(doc))
                        .unwrap_or(0)
                        .max(0) as f64;
                    (score as f64).max(0.001) * (1.0 + pop.ln_1p() / 20.0)
                }
            },
        );

        let top_docs = searcher.search(query.as_ref(), &collector)?;
        let mut ids = Vec::with_capacity(top_docs.len());
        for (_, address) in top_docs {
            let doc: tantivy::TantivyDocument = searcher.doc(address)?;
            if let Some(id) = doc.get_first(self.fields.id).and_then(|v| v.as_i64()) {
                ids.push(PlaceId(id));
            }
        }
        Ok(ids)
    }

    fn trigram_terms(&self, text: &str) -> Vec<Term> {
        let Some(mut tokenizer) = self.index.tokenizers().get(TRIGRAM) else {
            return Vec::new();
        };
        let mut stream = tokenizer.token_stream(text);
        let mut terms = Vec::new();
        while let Some(token) = stream.next() {
            terms.push(Term::from_field_text(self.fields.name, &token.text));
        }
        terms
    }

    /// Trigrams of adjacent-swap variants of 3-4 character words that are not
    /// already in `seen`. Short words have too few trigrams to survive a swap.
    fn transposition_trigrams(&self, words: &[&str], seen: &mut HashSet<Term>) -> Vec<Term> {
        let mut extra = Vec::new();
        for word in words {
            let chars: Vec<char> = word.chars().collect();
            if !(3..=4).contains(&chars.len()) {
                continue;
            }
            for i in 0..chars.len() - 1 {
                let mut swapped = chars.clone();
                swapped.swap(i, i + 1);
                let variant: String = swapped.into_iter().collect();
                if variant == *word {
                    continue;
                }
                for term in self.trigram_terms(&variant) {
                    if seen.insert(term.clone()) {
                        extra.push(term);
                    }
                }
            }
        }
        extra
    }

    /// One Levenshtein-automaton clause per word long enough to tolerate typos.
    /// The last word also matches as a prefix so partial input recalls.
    fn fuzzy_word_clauses(&self, words: &[&str]) -> Vec<Box<dyn Query>> {
        let mut clauses: Vec<Box<dyn Query>> = Vec::new();
        for (i, word) in words.iter().enumerate() {
            let distance = word_edit_budget(word.chars().count());
            if distance == 0 {
                continue;
            }
            let term = Term::from_field_text(self.fields.name_words, word);
            if i == words.len() - 1 {
                clauses.push(Box::new(FuzzyTermQuery::new_prefix(term, distance, true)));
            } else {
                clauses.push(Box::new(FuzzyTermQuery::new(term, distance, true)));
            }
        }
        clauses
    }

    fn build_name_query(&self, folded_query: &str) -> Box<dyn Query> {
        let words: Vec<&str> = folded_query.split_whitespace().collect();

        let terms = self.trigram_terms(folded_query);
        let mut seen: HashSet<Term> = terms.iter().cloned().collect();
        let num_terms = terms.len();
        let variants = self.transposition_trigrams(&words, &mut seen);

        let trigram_clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .into_iter()
            .chain(variants)
            .map(|term| {
                let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::Basic));
                (Occur::Should, q)
            })
            .collect();
        let mut trigram_query = BooleanQuery::new(trigram_clauses);
        if num_terms >= 3 {
            let min_match = if num_terms >= 7 {
                (num_terms * 2 / 3).max(4)
            } else {
                num_terms.div_ceil(2)
            };
            trigram_query.set_minimum_number_should_match(min_match);
        }

        let fuzzy_clauses = self.fuzzy_word_clauses(&words);
        let recall: Box<dyn Query> = if fuzzy_clauses.is_empty() {
            Box::new(trigram_query)
        } else {
            let needed = fuzzy_clauses.len().div_ceil(2);
            let mut fuzzy_query = BooleanQuery::new(
                fuzzy_clauses
                    .into_iter()
                    .map(|q| (Occur::Should, q))
                    .collect(),
            );
            fuzzy_query.set_minimum_number_should_match(needed);

            let mut either = BooleanQuery::new(vec![
                (Occur::Should, Box::new(trigram_query) as Box<dyn Query>),
                (Occur::Should, Box::new(fuzzy_query) as Box<dyn Query>),
            ]);
            either.set_minimum_number_should_match(1);
            Box::new(either)
        };

        let mut boosts: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for word in &words {
            let word_terms = self.trigram_terms(word);
            if word_terms.len() >= 2 {
                boosts.push((
                    Occur::Should,
                    Box::new(BoostQuery::new(Box::new(PhraseQuery::new(word_terms)), 2.0)),
                ));
            }
        }
        if words.len() >= 2 {
            let full_terms = self.trigram_terms(folded_query);
            if full_terms.len() >= 2 {
                boosts.push((
                    Occur::Should,
                    Box::new(BoostQuery::new(Box::new(PhraseQuery::new(full_terms)), 5.0)),
                ));
            }
        }

        if boosts.is_empty() {
            recall
        } else {
            let mut outer = vec![(Occur::Must, recall)];
            outer.extend(boosts);
            Box::new(BooleanQuery::new(outer))
        }
    }
}

/// Edit budget for a word of `len` characters.
fn word_edit_budget(len: usize) -> u8 {
    if len < 4 {
        0
    } else if len <= 7 {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(id: i64, name: &str, country: &str, population: i64) -> PlaceRecord {
        PlaceRecord {
            id: PlaceId(id),
            name: name.into(),
            ascii_name: deunicode::deunicode(name),
            country_code: country.into(),
            country_name: None,
            state_code: None,
            state_name: None,
            latitude: 0.0,
            longitude: 0.0,
            population: Some(population),
            search_rank: None,
        }
    }

    fn index_of(places: &[PlaceRecord]) -> PlaceIndex {
        let index = PlaceIndex::in_memory().unwrap();
        for p in places {
            index.add_place(p).unwrap();
        }
        index.commit().unwrap();
        index
    }

    fn sample() -> PlaceIndex {
        index_of(&[
            place(1, "London", "GB", 8_900_000),
            place(2, "London", "CA", 400_000),
            place(3, "Paris", "FR", 2_100_000),
            place(4, "Berlin", "DE", 3_600_000),
            place(5, "Londonderry", "GB", 85_000),
            place(6, "Zürich", "CH", 400_000),
        ])
    }

    #[test]
    fn test_phrase_query_works_with_position_fix() {
        let index = index_of(&[place(1, "Paris", "FR", 1), place(2, "Sparta", "GR", 1)]);
        let reader = index.reader.read();
        let searcher = reader.searcher();

        // "sparta" shares the "par" trigram but not the contiguous run
        let phrase = PhraseQuery::new(index.trigram_terms("paris"));
        let hits = searcher.search(&phrase, &TopDocs::with_limit(10)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_upsert_semantics() {
        let index = index_of(&[place(1, "London", "GB", 1)]);
        index.add_place(&place(1, "Londres", "GB", 1)).unwrap();
        index.commit().unwrap();
        assert_eq!(index.num_docs(), 1);
    }

    #[test]
    fn test_clear() {
        let index = sample();
        assert_eq!(index.num_docs(), 6);
        index.clear().unwrap();
        assert_eq!(index.num_docs(), 0);
    }

    #[test]
    fn test_typo_recall() {
        let index = sample();
        let ids = index.search("londn", None, 10).unwrap();
        assert!(ids.contains(&PlaceId(1)), "got {ids:?}");
        assert!(ids.contains(&PlaceId(2)), "got {ids:?}");
        assert!(!ids.contains(&PlaceId(3)));
    }

    #[test]
    fn test_substitution_recall() {
        let index = sample();
        let ids = index.search("berlim", None, 10).unwrap();
        assert!(ids.contains(&PlaceId(4)), "got {ids:?}");
    }

    #[test]
    fn test_transposition_recall_short_word() {
        let index = index_of(&[place(1, "Rome", "IT", 1), place(2, "Oslo", "NO", 1)]);
        let ids = index.search("roem", None, 10).unwrap();
        assert_eq!(ids, vec![PlaceId(1)]);
    }

    #[test]
    fn test_country_filter() {
        let index = sample();
        let ids = index.search("london", Some("ca"), 10).unwrap();
        assert_eq!(ids, vec![PlaceId(2)]);
    }

    #[test]
    fn test_population_breaks_text_ties() {
        let index = sample();
        let ids = index.search("london", None, 10).unwrap();
        assert_eq!(&ids[..2], &[PlaceId(1), PlaceId(2)]);
    }

    #[test]
    fn test_folded_names_are_indexed() {
        let index = sample();
        let ids = index.search("zurich", None, 10).unwrap();
        assert_eq!(ids, vec![PlaceId(6)]);
    }

    #[test]
    fn test_short_query_recalls_nothing() {
        let index = sample();
        assert!(index.search("lo", None, 10).unwrap().is_empty());
        assert!(!PlaceIndex::can_serve("lo"));
    }

    #[test]
    fn test_on_disk_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = PlaceIndex::open(dir.path()).unwrap();
            index.add_place(&place(1, "Paris", "FR", 1)).unwrap();
            index.commit().unwrap();
        }
        let index = PlaceIndex::open(dir.path()).unwrap();
        assert_eq!(index.num_docs(), 1);
        assert_eq!(index.search("paris", None, 5).unwrap(), vec![PlaceId(1)]);
    }
}
