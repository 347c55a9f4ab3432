//! Case-insensitive classification of incoming SQL statements.

/// What kind of statement the user submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryClass {
    Select,
    DropTable { db: Option<String>, table: String },
    DropDb { db: String },
    FlushChunksCache { db: Option<String> },
    Invalid,
}

/// Classify one statement. Structure matching only; SELECT statements get
/// their real analysis later.
pub fn classify(sql: &str) -> QueryClass {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.is_empty() {
        return QueryClass::Invalid;
    }
    let kw = |i: usize, word: &str| {
        tokens
            .get(i)
            .map(|t| t.eq_ignore_ascii_case(word))
            .unwrap_or(false)
    };

    if kw(0, "SELECT") {
        return QueryClass::Select;
    }

    if kw(0, "DROP") && kw(1, "TABLE") && tokens.len() == 3 {
        let name = tokens[2];
        return match name.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => QueryClass::DropTable {
                db: Some(db.to_string()),
                table: table.to_string(),
            },
            Some(_) => QueryClass::Invalid,
            None => QueryClass::DropTable {
                db: None,
                table: name.to_string(),
            },
        };
    }

    if kw(0, "DROP") && kw(1, "DATABASE") && tokens.len() == 3 {
        return QueryClass::DropDb {
            db: tokens[2].to_string(),
        };
    }

    if kw(0, "FLUSH") && kw(1, "QSERV_CHUNKS_CACHE") {
        return match tokens.len() {
            2 => QueryClass::FlushChunksCache { db: None },
            4 if kw(2, "FOR") => QueryClass::FlushChunksCache {
                db: Some(tokens[3].to_string()),
            },
            _ => QueryClass::Invalid,
        };
    }

    QueryClass::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select() {
        assert_eq!(classify("SELECT * FROM Object"), QueryClass::Select);
        assert_eq!(classify("  select 1;"), QueryClass::Select);
        assert_eq!(classify("SeLeCt chunkId FROM Object"), QueryClass::Select);
    }

    #[test]
    fn test_drop_table() {
        assert_eq!(
            classify("DROP TABLE Object"),
            QueryClass::DropTable {
                db: None,
                table: "Object".into()
            }
        );
        assert_eq!(
            classify("drop table LSST.Object;"),
            QueryClass::DropTable {
                db: Some("LSST".into()),
                table: "Object".into()
            }
        );
        assert_eq!(classify("DROP TABLE"), QueryClass::Invalid);
        assert_eq!(classify("DROP TABLE a b"), QueryClass::Invalid);
        assert_eq!(classify("DROP TABLE .x"), QueryClass::Invalid);
    }

    #[test]
    fn test_drop_database() {
        assert_eq!(
            classify("DROP DATABASE LSST"),
            QueryClass::DropDb { db: "LSST".into() }
        );
        assert_eq!(classify("DROP DATABASE"), QueryClass::Invalid);
    }

    #[test]
    fn test_flush_chunks_cache() {
        assert_eq!(
            classify("FLUSH QSERV_CHUNKS_CACHE"),
            QueryClass::FlushChunksCache { db: None }
        );
        assert_eq!(
            classify("flush qserv_chunks_cache for LSST;"),
            QueryClass::FlushChunksCache {
                db: Some("LSST".into())
            }
        );
        assert_eq!(classify("FLUSH QSERV_CHUNKS_CACHE LSST"), QueryClass::Invalid);
    }

    #[test]
    fn test_everything_else_invalid() {
        assert_eq!(classify(""), QueryClass::Invalid);
        assert_eq!(classify("INSERT INTO t VALUES (1)"), QueryClass::Invalid);
        assert_eq!(classify("UPDATE t SET x = 1"), QueryClass::Invalid);
        assert_eq!(classify("CREATE TABLE t (x INT)"), QueryClass::Invalid);
    }
}
