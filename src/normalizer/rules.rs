use crate::models::Unit;
use regex::Regex;
use std::sync::LazyLock;

/// Categories seeded into the catalog. `OTHER` is added separately as the fallback.
pub const CATEGORIES: &[&str] = &[
    "PRODUCE",
    "GROCERY",
    "BEVERAGES",
    "DAIRY",
    "MEAT",
    "BAKERY",
    "FROZEN",
    "CLEANING",
    "HYGIENE",
    "PET",
];

/// Keyword -> category. The longest matching keyword wins, so
/// "AGUA SANITARIA" beats "AGUA" and "TEMPERO VERDE" beats "VERDE".
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    // produce
    ("TEMPERO VERDE", "PRODUCE"),
    ("ALFACE", "PRODUCE"),
    ("TOMATE", "PRODUCE"),
    ("CEBOLA", "PRODUCE"),
    ("BATATA", "PRODUCE"),
    ("CENOURA", "PRODUCE"),
    ("ALHO", "PRODUCE"),
    ("BANANA", "PRODUCE"),
    ("MACA", "PRODUCE"),
    ("LARANJA", "PRODUCE"),
    ("LIMAO", "PRODUCE"),
    ("MAMAO", "PRODUCE"),
    ("COUVE", "PRODUCE"),
    ("REPOLHO", "PRODUCE"),
    ("PIMENTAO", "PRODUCE"),
    // grocery
    ("ARROZ", "GROCERY"),
    ("FEIJAO", "GROCERY"),
    ("MACARRAO", "GROCERY"),
    ("ACUCAR", "GROCERY"),
    ("CAFE", "GROCERY"),
    ("OLEO", "GROCERY"),
    ("AZEITE", "GROCERY"),
    ("SAL", "GROCERY"),
    ("FARINHA", "GROCERY"),
    ("MILHO", "GROCERY"),
    ("ERVILHA", "GROCERY"),
    ("EXTRATO", "GROCERY"),
    ("MOLHO", "GROCERY"),
    ("BISCOITO", "GROCERY"),
    ("ACHOCOLATADO", "GROCERY"),
    ("OVOS", "GROCERY"),
    ("MAIONESE", "GROCERY"),
    // beverages
    ("REFRIGERANTE", "BEVERAGES"),
    ("SUCO", "BEVERAGES"),
    ("AGUA", "BEVERAGES"),
    ("AGUA MINERAL", "BEVERAGES"),
    ("CERVEJA", "BEVERAGES"),
    ("VINHO", "BEVERAGES"),
    // dairy and cold cuts
    ("LEITE", "DAIRY"),
    ("LEITE CONDENSADO", "GROCERY"),
    ("QUEIJO", "DAIRY"),
    ("IOGURTE", "DAIRY"),
    ("MANTEIGA", "DAIRY"),
    ("MARGARINA", "DAIRY"),
    ("REQUEIJAO", "DAIRY"),
    ("CREME DE LEITE", "DAIRY"),
    ("PRESUNTO", "DAIRY"),
    ("MUSSARELA", "DAIRY"),
    // meat
    ("CARNE", "MEAT"),
    ("FRANGO", "MEAT"),
    ("LINGUICA", "MEAT"),
    ("BACON", "MEAT"),
    ("PATINHO", "MEAT"),
    ("ACEM", "MEAT"),
    ("PEIXE", "MEAT"),
    ("SALSICHA", "MEAT"),
    // bakery
    ("PAO", "BAKERY"),
    ("BOLO", "BAKERY"),
    ("TORRADA", "BAKERY"),
    // frozen
    ("SORVETE", "FROZEN"),
    ("PIZZA", "FROZEN"),
    ("LASANHA", "FROZEN"),
    ("NUGGETS", "FROZEN"),
    ("CONGELADO", "FROZEN"),
    // cleaning
    ("DETERGENTE", "CLEANING"),
    ("SABAO", "CLEANING"),
    ("AMACIANTE", "CLEANING"),
    ("DESINFETANTE", "CLEANING"),
    ("AGUA SANITARIA", "CLEANING"),
    ("ALVEJANTE", "CLEANING"),
    ("ESPONJA", "CLEANING"),
    // hygiene
    ("SABONETE", "HYGIENE"),
    ("SHAMPOO", "HYGIENE"),
    ("CONDICIONADOR", "HYGIENE"),
    ("CREME DENTAL", "HYGIENE"),
    ("PAPEL HIGIENICO", "HYGIENE"),
    ("DESODORANTE", "HYGIENE"),
    ("FRALDA", "HYGIENE"),
    // pet
    ("RACAO", "PET"),
    ("AREIA HIGIENICA", "PET"),
];

/// Brand tokens kept in the canonical name and reported separately.
const BRANDS: &[&str] = &[
    "PREDILETO",
    "TIO JOAO",
    "CAMIL",
    "KICALDO",
    "NESTLE",
    "ITALAC",
    "PIRACANJUBA",
    "PARMALAT",
    "SADIA",
    "PERDIGAO",
    "SEARA",
    "QUALY",
    "YPE",
    "OMO",
    "COCA COLA",
    "GUARANA ANTARCTICA",
    "PILAO",
    "MELITTA",
    "UNIAO",
    "LIZA",
    "SOYA",
    "QUERO",
    "FUGINI",
    "ADRIA",
    "VITARELLA",
    "DANONE",
    "BAUDUCCO",
    "KNORR",
    "MAGGI",
    "COLGATE",
    "DOVE",
    "NIVEA",
];

/// Receipt abbreviations expanded token by token.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("ARR", "ARROZ"),
    ("FEIJ", "FEIJAO"),
    ("REFRIG", "REFRIGERANTE"),
    ("REFRI", "REFRIGERANTE"),
    ("BISC", "BISCOITO"),
    ("DET", "DETERGENTE"),
    ("QJO", "QUEIJO"),
    ("MUSS", "MUSSARELA"),
    ("IOG", "IOGURTE"),
    ("LTE", "LEITE"),
    ("CR", "CREME"),
    ("TRAD", "TRADICIONAL"),
    ("INTEG", "INTEGRAL"),
    ("DESNAT", "DESNATADO"),
    ("MARG", "MARGARINA"),
];

/// Packaging words that say nothing about the product itself.
const PACKAGING: &[&str] = &[
    "PCT", "PACOTE", "EMB", "EMBALAGEM", "CX", "CAIXA", "SACHE", "LATA", "GARRAFA", "PET",
    "FD", "FARDO", "BDJ", "BANDEJA", "UN", "UND", "UNID", "VD", "TP",
];

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+(?:[.,]\d+)?)\s*(KG|KGS|GR|GRS|G|MG|ML|LTS|LT|L)\b").unwrap()
});

static MULTIPACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:C/\s*\d+|\d+\s*X\s*\d+\w*|\d+\s*(?:UN|UND|UNID|UNIDADES))\b").unwrap()
});

static LEADING_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{3,}\s+").unwrap());

static PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Z0-9\s]").unwrap());

/// Uppercase, strip Portuguese diacritics and collapse whitespace.
pub fn fold(s: &str) -> String {
    let upper: String = s
        .to_uppercase()
        .chars()
        .map(|c| match c {
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'Ñ' => 'N',
            other => other,
        })
        .collect();
    upper.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A raw description with noise removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Cleaned {
    pub name: String,
    pub brand: Option<String>,
    pub size: Option<String>,
    /// A bare `KG` token, as printed for produce sold by weight.
    pub sold_by_weight: bool,
}

pub fn clean(raw: &str) -> Cleaned {
    let folded = fold(raw);
    let folded = LEADING_CODE_RE.replace(&folded, "").into_owned();

    let size = SIZE_RE
        .captures(&folded)
        .map(|c| format!("{}{}", c[1].replace(',', "."), normalize_size_unit(&c[2])));
    let stripped = SIZE_RE.replace_all(&folded, " ");
    let stripped = MULTIPACK_RE.replace_all(&stripped, " ");
    let stripped = PUNCT_RE.replace_all(&stripped, " ");

    let mut sold_by_weight = false;
    let tokens: Vec<&str> = stripped
        .split_whitespace()
        .filter(|t| {
            if *t == "KG" {
                sold_by_weight = true;
                return false;
            }
            !PACKAGING.contains(t)
        })
        .map(|t| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == t)
                .map_or(t, |(_, full)| *full)
        })
        .collect();
    let name = tokens.join(" ");

    let padded = format!(" {name} ");
    let brand = BRANDS
        .iter()
        .filter(|b| padded.contains(&format!(" {b} ")))
        .max_by_key(|b| b.len())
        .map(|b| b.to_string());

    Cleaned {
        name,
        brand,
        size,
        sold_by_weight,
    }
}

fn normalize_size_unit(raw: &str) -> &'static str {
    match raw {
        "KG" | "KGS" => "KG",
        "GR" | "GRS" | "G" => "G",
        "MG" => "MG",
        "ML" => "ML",
        _ => "L",
    }
}

/// Category from the keyword table, matching whole words only.
pub fn category_for(name: &str) -> Option<&'static str> {
    let padded = format!(" {name} ");
    CATEGORY_KEYWORDS
        .iter()
        .filter(|(kw, _)| padded.contains(&format!(" {kw} ")))
        .max_by_key(|(kw, _)| kw.len())
        .map(|(_, cat)| *cat)
}

/// Map a raw unit token onto the closed unit set.
pub fn canonical_unit(raw: &str) -> Option<Unit> {
    match fold(raw).trim_end_matches('.') {
        "UN" | "UND" | "UNID" | "UNIDADE" | "UNIDADES" | "U" | "PC" | "PCS" | "PCT" | "PACOTE"
        | "CX" | "CAIXA" | "DZ" | "FD" | "BJ" | "BD" | "LATA" | "GARRAFA" => Some(Unit::Each),
        "KG" | "KGS" | "QUILO" | "KILO" | "QUILOGRAMA" => Some(Unit::Kilogram),
        "G" | "GR" | "GRS" | "GRAMA" | "GRAMAS" => Some(Unit::Gram),
        "L" | "LT" | "LTS" | "LITRO" | "LITROS" => Some(Unit::Litre),
        "ML" => Some(Unit::Millilitre),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_and_brand_are_split_out() {
        let c = clean("Milho Verde Predileto 170g");
        assert_eq!(c.name, "MILHO VERDE PREDILETO");
        assert_eq!(c.brand.as_deref(), Some("PREDILETO"));
        assert_eq!(c.size.as_deref(), Some("170G"));
        assert_eq!(category_for(&c.name), Some("GROCERY"));
    }

    #[test]
    fn test_abbreviations_and_packaging_noise() {
        let c = clean("7891234 ARR TIO JOAO T1 5KG PCT");
        assert_eq!(c.name, "ARROZ TIO JOAO T1");
        assert_eq!(c.brand.as_deref(), Some("TIO JOAO"));
        assert_eq!(c.size.as_deref(), Some("5KG"));

        let c = clean("REFRIG COCA-COLA PET 2L");
        assert_eq!(c.name, "REFRIGERANTE COCA COLA");
        assert_eq!(c.brand.as_deref(), Some("COCA COLA"));
        assert_eq!(c.size.as_deref(), Some("2L"));

        let c = clean("IOG NESTLE C/6 UN 1,2KG");
        assert_eq!(c.name, "IOGURTE NESTLE");
        assert_eq!(c.size.as_deref(), Some("1.2KG"));
    }

    #[test]
    fn test_bare_kg_means_sold_by_weight() {
        let c = clean("BANANA PRATA KG");
        assert_eq!(c.name, "BANANA PRATA");
        assert!(c.sold_by_weight);
        assert!(!clean("FEIJAO 1KG").sold_by_weight);
    }

    #[test]
    fn test_longest_keyword_wins() {
        assert_eq!(category_for("TEMPERO VERDE"), Some("PRODUCE"));
        assert_eq!(category_for("AGUA SANITARIA QBOA"), Some("CLEANING"));
        assert_eq!(category_for("AGUA MINERAL CRYSTAL"), Some("BEVERAGES"));
        assert_eq!(category_for("LEITE CONDENSADO MOCA"), Some("GROCERY"));
        assert_eq!(category_for("SALGADINHO"), None);
        assert_eq!(category_for(&fold("Feijão Carioca")), Some("GROCERY"));
    }

    #[test]
    fn test_unit_synonyms() {
        assert_eq!(canonical_unit("unidade"), Some(Unit::Each));
        assert_eq!(canonical_unit("un"), Some(Unit::Each));
        assert_eq!(canonical_unit("pct"), Some(Unit::Each));
        assert_eq!(canonical_unit("Kg"), Some(Unit::Kilogram));
        assert_eq!(canonical_unit("lt."), Some(Unit::Litre));
        assert_eq!(canonical_unit("ml"), Some(Unit::Millilitre));
        assert_eq!(canonical_unit("??"), None);
    }
}
