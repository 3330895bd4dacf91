//! Lenient CSV bundle store: name/id lookups, character sheets, GAMEBASE
//! metadata. Field syntax is comma-split with `;` comments and tolerant
//! column counts, so parsing stays hand-rolled rather than RFC-strict.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CsvStore {
    rows_by_base: HashMap<String, Vec<Vec<String>>>,
    chara_rows_by_id: HashMap<i64, Vec<Vec<String>>>,
    name_by_base: HashMap<String, HashMap<i64, String>>,
    chara_exists: HashMap<i64, ()>,
    game_code: i64,
    game_version: i64,
    has_game_code: bool,
    has_game_version: bool,
    game_title: String,
    game_author: String,
    game_year: String,
    window_title: String,
    game_info: String,
}

impl CsvStore {
    pub fn new(files: &HashMap<String, String>) -> Self {
        let mut s = CsvStore::default();
        for (file, content) in files {
            let base = csv_base_name(file);
            if base.is_empty() {
                continue;
            }
            let rows = parse_csv_content(content);
            if let Some(id) = chara_id_from_base(&base) {
                s.chara_exists.insert(id, ());
                s.chara_rows_by_id.insert(id, rows.clone());
            }
            if base == "GAMEBASE" {
                s.ingest_gamebase(&rows);
            }
            let mut name_map = HashMap::new();
            for row in &rows {
                if row.len() < 2 {
                    continue;
                }
                if let Ok(id) = row[0].trim().parse::<i64>() {
                    name_map.insert(id, row[1].trim().to_string());
                }
            }
            s.ingest_character_name_rows(&base, &rows);
            s.name_by_base.entry(base.clone()).or_default().extend(name_map);
            s.rows_by_base.insert(base, rows);
        }
        s
    }

    fn ingest_gamebase(&mut self, rows: &[Vec<String>]) {
        for row in rows {
            if row.len() < 2 {
                continue;
            }
            let key = row[0].trim();
            let val = row[1].trim().to_string();
            match key.to_uppercase().as_str() {
                "CODE" => self.set_game_code(&val),
                "VERSION" => self.set_game_version(&val),
                "TITLE" => self.game_title = val,
                "AUTHOR" => self.game_author = val,
                "YEAR" => self.game_year = val,
                "WINDOWTITLE" => self.window_title = val,
                "INFO" => self.game_info = val,
                _ => match key {
                    "コード" | "코드" => self.set_game_code(&val),
                    "バージョン" | "버전" => self.set_game_version(&val),
                    "タイトル" | "타이틀" => self.game_title = val,
                    "作者" | "작자" => self.game_author = val,
                    "製作年" | "시작년" => self.game_year = val,
                    "ウィンドウタイトル" | "윈도우타이틀" => self.window_title = val,
                    "追加情報" | "추가정보" => self.game_info = val,
                    _ => {}
                },
            }
        }
    }

    fn set_game_code(&mut self, val: &str) {
        if let Ok(n) = val.trim().parse() {
            self.game_code = n;
            self.has_game_code = true;
        }
    }

    fn set_game_version(&mut self, val: &str) {
        if let Ok(n) = val.trim().parse() {
            self.game_version = n;
            self.has_game_version = true;
        }
    }

    // CHARAnnn sheets seed the NAME/CALLNAME lookup tables.
    fn ingest_character_name_rows(&mut self, base: &str, rows: &[Vec<String>]) {
        let Some(mut id) = chara_id_from_base(base) else { return };
        let mut name = String::new();
        let mut call_name = String::new();
        for row in rows {
            if row.len() < 2 {
                continue;
            }
            let key = row[0].trim();
            let val = row[1].trim();
            match key {
                "番号" | "번호" | "NO" | "ID" => {
                    if let Ok(n) = val.parse() {
                        id = n;
                    }
                }
                "名前" | "이름" | "NAME" => name = val.to_string(),
                "呼び名" | "호칭" | "CALLNAME" => call_name = val.to_string(),
                _ => {}
            }
        }
        if name.is_empty() && call_name.is_empty() {
            return;
        }
        if name.is_empty() {
            name = call_name.clone();
        }
        if call_name.is_empty() {
            call_name = name.clone();
        }
        self.name_by_base.entry("NAME".to_string()).or_default().insert(id, name);
        self.name_by_base.entry("CALLNAME".to_string()).or_default().insert(id, call_name);
    }

    pub fn name(&self, base: &str, id: i64) -> Option<&str> {
        self.name_by_base
            .get(&base.trim().to_uppercase())?
            .get(&id)
            .map(|s| s.as_str())
    }

    pub fn find_id(&self, base: &str, name: &str) -> Option<i64> {
        let rows = self.rows_by_base.get(&base.trim().to_uppercase())?;
        let target = name.trim();
        for row in rows {
            if row.len() < 2 {
                continue;
            }
            if !row[1].trim().eq_ignore_ascii_case(target) {
                continue;
            }
            if let Ok(id) = row[0].trim().parse() {
                return Some(id);
            }
        }
        None
    }

    pub fn exists(&self, base: &str) -> bool {
        self.rows_by_base.contains_key(&base.trim().to_uppercase())
    }

    pub fn exists_id(&self, id: i64) -> bool {
        if self.chara_exists.contains_key(&id) {
            return true;
        }
        self.name_by_base
            .get("RELATION")
            .map_or(false, |m| m.contains_key(&id))
    }

    pub fn chara_field(&self, id: i64, section: &str, key: &str) -> Option<String> {
        let rows = self.chara_rows_by_id.get(&id)?;
        let section = section.trim().to_uppercase();
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        for row in rows {
            if row.len() < 2 {
                continue;
            }
            if !csv_section_matches(&section, &row[0]) {
                continue;
            }
            if row[1].trim() != key {
                continue;
            }
            return Some(row.get(2).map(|s| s.trim().to_string()).unwrap_or_default());
        }
        None
    }

    pub fn game_code_version(&self) -> (i64, i64, bool, bool) {
        (self.game_code, self.game_version, self.has_game_code, self.has_game_version)
    }

    pub fn game_meta(&self) -> (&str, &str, &str, &str, &str) {
        (
            &self.game_title,
            &self.game_author,
            &self.game_year,
            &self.window_title,
            &self.game_info,
        )
    }
}

fn csv_section_matches(section: &str, actual: &str) -> bool {
    let actual = actual.trim();
    match section {
        "CSTR" => actual.eq_ignore_ascii_case("CSTR"),
        "BASE" => actual == "基礎" || actual.eq_ignore_ascii_case("BASE"),
        "TALENT" => actual == "素質" || actual.eq_ignore_ascii_case("TALENT"),
        "ABL" => actual == "能力" || actual.eq_ignore_ascii_case("ABL"),
        "EXP" => actual == "経験" || actual.eq_ignore_ascii_case("EXP"),
        "RELATION" => actual == "相性" || actual.eq_ignore_ascii_case("RELATION"),
        "EQUIP" => actual == "装着物" || actual.eq_ignore_ascii_case("EQUIP"),
        _ => actual.eq_ignore_ascii_case(section),
    }
}

fn parse_csv_content(raw: &str) -> Vec<Vec<String>> {
    let raw = raw.strip_prefix('\u{FEFF}').unwrap_or(raw);
    let raw = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut rows = Vec::new();
    for line in raw.split('\n') {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(i) = line.find(';') {
            line = line[..i].trim();
            if line.is_empty() {
                continue;
            }
        }
        let row: Vec<String> = line.split(',').map(|f| f.trim().to_string()).collect();
        rows.push(row);
    }
    rows
}

fn csv_base_name(file: &str) -> String {
    let up = file.trim().to_uppercase();
    let Some(stem) = up.strip_suffix(".CSV") else { return String::new() };
    let stem = stem.rsplit(['/', '\\']).next().unwrap_or(stem);
    stem.to_string()
}

fn chara_id_from_base(base: &str) -> Option<i64> {
    let rest = base.trim().to_uppercase();
    let rest = rest.strip_prefix("CHARA")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(entries: &[(&str, &str)]) -> CsvStore {
        let files: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CsvStore::new(&files)
    }

    #[test]
    fn name_and_id_lookups() {
        let s = store(&[("FLAG.CSV", "5,MODE ; comment\n8,CHARA_TOTAL\n")]);
        assert_eq!(s.name("FLAG", 5), Some("MODE"));
        assert_eq!(s.find_id("FLAG", "mode"), Some(5));
        assert_eq!(s.find_id("FLAG", "missing"), None);
        assert!(s.exists("flag.csv".trim_end_matches(".csv")));
    }

    #[test]
    fn gamebase_meta_multilingual() {
        let s = store(&[("GAMEBASE.CSV", "コード,77\nVERSION,3\nTITLE,Example\n")]);
        let (code, version, has_code, has_version) = s.game_code_version();
        assert_eq!((code, version), (77, 3));
        assert!(has_code && has_version);
        assert_eq!(s.game_meta().0, "Example");
    }

    #[test]
    fn chara_sheet_sections_and_names() {
        let s = store(&[(
            "CHARA001.CSV",
            "番号,1\n名前,Alice\nCSTR,0,blue\n素質,kind,1\n",
        )]);
        assert!(s.exists_id(1));
        assert_eq!(s.name("NAME", 1), Some("Alice"));
        assert_eq!(s.name("CALLNAME", 1), Some("Alice"));
        assert_eq!(s.chara_field(1, "CSTR", "0").as_deref(), Some("blue"));
        assert_eq!(s.chara_field(1, "TALENT", "kind").as_deref(), Some("1"));
    }

    #[test]
    fn lenient_rows_survive() {
        let s = store(&[("ITEM.CSV", "0,rope,100\n1,knife\n\n;full comment\n2\n")]);
        assert_eq!(s.name("ITEM", 0), Some("rope"));
        assert_eq!(s.name("ITEM", 1), Some("knife"));
        assert_eq!(s.name("ITEM", 2), None);
    }
}
