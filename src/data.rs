//! Posts, pieces and collections.
//!
//! A node's catalog is an ordered list of posts. Posts are grouped into
//! fixed-size pieces; each piece hashes independently (SHA3-256 over its
//! serialized records) and the collection is the ordered list of those piece
//! hashes. The SHA3-256 root over the hash list is what the owner signs, so
//! a mirror can verify an entire catalog against one signature, piece by
//! piece.
//!
//! The piece wire format is a gzip stream of `|`-delimited records, ten
//! fields per post, terminated by a record whose id is `-1`. It is frozen
//! for interoperability.
//!
//! The post database itself (SQLite, full-text search) lives outside the
//! core behind the [`CatalogStore`] trait.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::RwLock;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::error::{Result, ZifError};

/// Posts per piece.
pub const PIECE_SIZE: usize = 1000;

/// Posts per page for recent/popular/search responses.
pub const MAX_PAGE_SIZE: usize = 25;

/// Decompressed ceiling for one piece-stream response.
pub const MAX_PIECE_STREAM: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    #[serde(rename = "infoHash")]
    pub info_hash: String,
    pub title: String,
    pub size: i64,
    #[serde(rename = "fileCount")]
    pub file_count: i64,
    pub seeders: i64,
    pub leechers: i64,
    #[serde(rename = "uploadDate")]
    pub upload_date: i64,
    pub tags: String,
    pub meta: String,
}

impl Post {
    pub fn valid(&self) -> Result<()> {
        if self.info_hash.is_empty() {
            return Err(ZifError::verify("post info hash must be set"));
        }
        if self.title.is_empty() {
            return Err(ZifError::verify("post title must be set"));
        }
        Ok(())
    }

    /// One wire record: every field followed by the delimiter.
    pub fn write_record<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write!(
            w,
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|",
            self.id,
            self.info_hash,
            self.title,
            self.size,
            self.file_count,
            self.seeders,
            self.leechers,
            self.upload_date,
            self.tags,
            self.meta
        )
    }

    fn record_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_record(&mut buf).expect("writing to a Vec cannot fail");
        buf
    }
}

/// Terminator for a piece stream.
pub fn terminator() -> Post {
    Post {
        id: -1,
        ..Default::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Piece {
    pub id: usize,
    pub posts: Vec<Post>,
}

impl Piece {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            posts: Vec::new(),
        }
    }

    pub fn add(&mut self, post: Post) {
        self.posts.push(post);
    }

    /// SHA3-256 over the concatenated wire records of this piece's posts.
    /// Both the collection builder and the mirror check use this, so a
    /// mirrored piece hashes identically to the original.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        for post in &self.posts {
            hasher.update(post.record_bytes());
        }
        hasher.finalize().into()
    }
}

/// Ordered hash list over a catalog's pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Collection {
    pub hash_list: Vec<u8>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn piece_count(&self) -> usize {
        self.hash_list.len() / 32
    }

    /// Record a piece's hash: appends for a new index, overwrites in place
    /// for an existing one.
    pub fn add_piece(&mut self, piece: &Piece) {
        let hash = piece.hash();
        let offset = piece.id * 32;

        if self.hash_list.len() < offset + 32 {
            self.hash_list.resize(offset + 32, 0);
        }
        self.hash_list[offset..offset + 32].copy_from_slice(&hash);
    }

    /// SHA3-256 over the concatenated piece hashes. This is the value the
    /// owner signs as `collection_sig`.
    pub fn root_hash(&self) -> [u8; 32] {
        root_hash_of(&self.hash_list)
    }

    /// Rebuild the hash list from a catalog store.
    pub fn build(store: &dyn CatalogStore, piece_size: usize) -> Result<Self> {
        let mut collection = Collection::new();
        let post_count = store.post_count();
        let piece_count = post_count.div_ceil(piece_size);

        for id in 0..piece_count {
            let piece = store.query_piece(id, piece_size)?;
            collection.add_piece(&piece);
        }

        Ok(collection)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.hash_list)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        if data.len() % 32 != 0 {
            return Err(ZifError::verify("collection file length not a multiple of 32"));
        }
        Ok(Self { hash_list: data })
    }

    /// Slot for piece `i`, if present.
    pub fn piece_hash(&self, i: usize) -> Option<&[u8]> {
        self.hash_list.get(i * 32..i * 32 + 32)
    }
}

pub fn root_hash_of(hash_list: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(hash_list);
    hasher.finalize().into()
}

/// Parse a gzip piece stream into pieces, starting at piece `start` and
/// expecting up to `count` pieces of `piece_size` posts. A record with
/// id `-1` ends the final (partial) piece; full pieces are delimited by
/// their post count alone.
pub fn parse_piece_stream(
    data: &[u8],
    start: usize,
    count: usize,
    piece_size: usize,
) -> Result<Vec<Piece>> {
    let decoder = GzDecoder::new(data);
    let mut reader = BufReader::new(decoder.take(MAX_PIECE_STREAM));

    let mut pieces = Vec::with_capacity(count);
    let mut terminated = false;

    'pieces: for i in 0..count {
        let mut piece = Piece::new(start + i);

        loop {
            if piece.posts.len() >= piece_size {
                break;
            }

            let id_field = match read_field(&mut reader)? {
                Some(field) => field,
                // Stream ended on a piece boundary
                None if piece.posts.is_empty() => break 'pieces,
                None => {
                    return Err(ZifError::protocol("piece stream ended mid-piece"));
                }
            };

            let id = parse_int(&id_field)?;
            if id == -1 {
                terminated = true;
                break;
            }

            let post = Post {
                id,
                info_hash: require_field(&mut reader)?,
                title: require_field(&mut reader)?,
                size: parse_int(&require_field(&mut reader)?)?,
                file_count: parse_int(&require_field(&mut reader)?)?,
                seeders: parse_int(&require_field(&mut reader)?)?,
                leechers: parse_int(&require_field(&mut reader)?)?,
                upload_date: parse_int(&require_field(&mut reader)?)?,
                tags: require_field(&mut reader)?,
                meta: require_field(&mut reader)?,
            };

            piece.add(post);
        }

        let empty = piece.posts.is_empty();
        if !empty {
            pieces.push(piece);
        }
        if terminated || empty {
            break;
        }
    }

    Ok(pieces)
}

fn read_field<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'|', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'|') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn require_field<R: BufRead>(reader: &mut R) -> Result<String> {
    read_field(reader)?.ok_or_else(|| ZifError::protocol("piece stream ended mid-record"))
}

fn parse_int(field: &str) -> Result<i64> {
    field
        .parse()
        .map_err(|_| ZifError::protocol(format!("bad integer field {field:?} in piece stream")))
}

/// Narrow interface onto the external post database. The core only ever
/// inserts posts, pages through query results and reads whole pieces.
pub trait CatalogStore: Send + Sync {
    /// Insert a post, returning its zero-based id.
    fn insert_post(&self, post: Post) -> Result<i64>;

    /// Attach metadata to an existing post.
    fn add_meta(&self, id: i64, meta: &str) -> Result<()>;

    fn post_count(&self) -> usize;

    /// All posts of piece `id` in insertion order.
    fn query_piece(&self, id: usize, piece_size: usize) -> Result<Piece>;

    fn query_recent(&self, page: usize) -> Result<Vec<Post>>;

    fn query_popular(&self, page: usize) -> Result<Vec<Post>>;

    fn search(&self, query: &str, page: usize) -> Result<Vec<Post>>;

    /// Title completions for a prefix.
    fn suggest(&self, prefix: &str) -> Result<Vec<String>>;

    /// Rebuild any derived search index.
    fn rebuild_index(&self) -> Result<()>;
}

/// In-memory catalog store; the production node is expected to plug in the
/// SQLite-backed database instead.
#[derive(Default)]
pub struct MemoryCatalog {
    posts: RwLock<Vec<Post>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn page<'a>(posts: impl Iterator<Item = &'a Post>, page: usize) -> Vec<Post> {
        posts
            .skip(page * MAX_PAGE_SIZE)
            .take(MAX_PAGE_SIZE)
            .cloned()
            .collect()
    }
}

impl CatalogStore for MemoryCatalog {
    fn insert_post(&self, mut post: Post) -> Result<i64> {
        let mut posts = self.posts.write().expect("catalog lock poisoned");
        let id = posts.len() as i64;
        post.id = id;
        posts.push(post);
        Ok(id)
    }

    fn add_meta(&self, id: i64, meta: &str) -> Result<()> {
        let mut posts = self.posts.write().expect("catalog lock poisoned");
        let post = posts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ZifError::protocol(format!("no post with id {id}")))?;
        post.meta = meta.to_string();
        Ok(())
    }

    fn post_count(&self) -> usize {
        self.posts.read().expect("catalog lock poisoned").len()
    }

    fn query_piece(&self, id: usize, piece_size: usize) -> Result<Piece> {
        let posts = self.posts.read().expect("catalog lock poisoned");
        let start = id * piece_size;
        let end = (start + piece_size).min(posts.len());

        let mut piece = Piece::new(id);
        if start < posts.len() {
            for post in &posts[start..end] {
                piece.add(post.clone());
            }
        }
        Ok(piece)
    }

    fn query_recent(&self, page: usize) -> Result<Vec<Post>> {
        let posts = self.posts.read().expect("catalog lock poisoned");
        Ok(Self::page(posts.iter().rev(), page))
    }

    fn query_popular(&self, page: usize) -> Result<Vec<Post>> {
        let posts = self.posts.read().expect("catalog lock poisoned");
        let mut by_seeders: Vec<&Post> = posts.iter().collect();
        by_seeders.sort_by(|a, b| b.seeders.cmp(&a.seeders));
        Ok(Self::page(by_seeders.into_iter(), page))
    }

    fn search(&self, query: &str, page: usize) -> Result<Vec<Post>> {
        let needle = query.to_lowercase();
        let posts = self.posts.read().expect("catalog lock poisoned");
        Ok(Self::page(
            posts.iter().filter(|p| {
                p.title.to_lowercase().contains(&needle) || p.tags.to_lowercase().contains(&needle)
            }),
            page,
        ))
    }

    fn suggest(&self, prefix: &str) -> Result<Vec<String>> {
        let needle = prefix.to_lowercase();
        let posts = self.posts.read().expect("catalog lock poisoned");
        Ok(posts
            .iter()
            .filter(|p| p.title.to_lowercase().starts_with(&needle))
            .take(MAX_PAGE_SIZE)
            .map(|p| p.title.clone())
            .collect())
    }

    fn rebuild_index(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn post(i: i64) -> Post {
        Post {
            id: i,
            info_hash: format!("hash{i}"),
            title: format!("post {i}"),
            size: 100 + i,
            file_count: 1,
            seeders: i,
            leechers: 0,
            upload_date: 1_500_000_000 + i,
            tags: "tag".into(),
            meta: String::new(),
        }
    }

    fn gzip_posts(posts: &[Post], with_terminator: bool) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for p in posts {
            p.write_record(&mut encoder).unwrap();
        }
        if with_terminator {
            terminator().write_record(&mut encoder).unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn piece_hash_covers_posts_in_order() {
        let mut a = Piece::new(0);
        a.add(post(0));
        a.add(post(1));

        let mut b = Piece::new(0);
        b.add(post(1));
        b.add(post(0));

        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.hash());
    }

    #[test]
    fn collection_add_appends_and_overwrites() {
        let mut collection = Collection::new();

        let mut p0 = Piece::new(0);
        p0.add(post(0));
        let mut p1 = Piece::new(1);
        p1.add(post(1));

        collection.add_piece(&p0);
        collection.add_piece(&p1);
        assert_eq!(collection.piece_count(), 2);
        assert_eq!(collection.piece_hash(0).unwrap(), p0.hash());
        assert_eq!(collection.piece_hash(1).unwrap(), p1.hash());

        // Overwriting piece 0 leaves piece 1 untouched
        let mut p0b = Piece::new(0);
        p0b.add(post(7));
        collection.add_piece(&p0b);
        assert_eq!(collection.piece_hash(0).unwrap(), p0b.hash());
        assert_eq!(collection.piece_hash(1).unwrap(), p1.hash());
    }

    #[test]
    fn root_hash_is_stable_across_rebuild() {
        let store = MemoryCatalog::new();
        for i in 0..10 {
            store.insert_post(post(i)).unwrap();
        }

        let first = Collection::build(&store, 4).unwrap();
        let second = Collection::build(&store, 4).unwrap();
        assert_eq!(first.root_hash(), second.root_hash());
        assert_eq!(first.piece_count(), 3);
    }

    #[test]
    fn collection_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.dat");

        let store = MemoryCatalog::new();
        for i in 0..5 {
            store.insert_post(post(i)).unwrap();
        }
        let collection = Collection::build(&store, 2).unwrap();
        collection.save(&path).unwrap();

        let loaded = Collection::load(&path).unwrap();
        assert_eq!(loaded, collection);

        std::fs::write(&path, [0u8; 33]).unwrap();
        assert!(Collection::load(&path).is_err());
    }

    #[test]
    fn parse_piece_stream_round_trip() {
        let posts: Vec<Post> = (0..7).map(post).collect();
        let data = gzip_posts(&posts, true);

        let pieces = parse_piece_stream(&data, 0, 3, 3).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].posts.len(), 3);
        assert_eq!(pieces[1].posts.len(), 3);
        assert_eq!(pieces[2].posts.len(), 1);
        assert_eq!(pieces[0].posts[0], posts[0]);
        assert_eq!(pieces[2].posts[0], posts[6]);
    }

    #[test]
    fn parse_piece_stream_rejects_truncation() {
        let posts: Vec<Post> = (0..3).map(post).collect();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for p in &posts {
            p.write_record(&mut encoder).unwrap();
        }
        // Half a record, then the stream dies
        encoder.write_all(b"4|deadbeef|torn").unwrap();
        let data = encoder.finish().unwrap();

        assert!(parse_piece_stream(&data, 0, 2, 3).is_err());
    }

    #[test]
    fn memory_catalog_pages_and_pieces() {
        let store = MemoryCatalog::new();
        for i in 0..30 {
            store.insert_post(post(i)).unwrap();
        }

        assert_eq!(store.post_count(), 30);
        assert_eq!(store.query_recent(0).unwrap().len(), MAX_PAGE_SIZE);
        assert_eq!(store.query_recent(1).unwrap().len(), 5);
        assert_eq!(store.query_recent(0).unwrap()[0].id, 29);

        let popular = store.query_popular(0).unwrap();
        assert_eq!(popular[0].seeders, 29);

        let piece = store.query_piece(1, 10).unwrap();
        assert_eq!(piece.posts.len(), 10);
        assert_eq!(piece.posts[0].id, 10);

        assert_eq!(store.search("post 2", 0).unwrap().len(), 11);
    }
}
