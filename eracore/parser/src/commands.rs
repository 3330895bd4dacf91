//! The reserved command keyword table. Every name here is recognized by the
//! statement parser even when the runtime treats it as a no-op, so hosts can
//! enumerate the full surface.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::expr::is_ident_part;

#[rustfmt::skip]
const COMMAND_NAMES: &[&str] = &[
    // Print family
    "PRINT", "PRINTL", "PRINTW", "PRINTV", "PRINTVL", "PRINTVW",
    "PRINTS", "PRINTSL", "PRINTSW", "PRINTFORM", "PRINTFORML", "PRINTFORMW",
    "PRINTFORMS", "PRINTFORMSL", "PRINTFORMSW", "PRINTC", "PRINTLC", "PRINTCL",
    "PRINTFORMC", "PRINTFORMLC", "PRINTBUTTON", "PRINTBUTTONC", "PRINTBUTTONLC",
    "PRINTPLAIN", "PRINTPLAINFORM",
    "PRINTK", "PRINTKL", "PRINTKW", "PRINTD", "PRINTDL", "PRINTDW",
    "PRINTSINGLE", "PRINTSINGLEL", "PRINTSINGLEV", "PRINTSINGLEVL",
    "PRINTSINGLES", "PRINTSINGLESL", "PRINTSINGLEFORM", "PRINTSINGLEFORML",
    "PRINTDATA", "PRINTDATAL", "PRINTDATAW", "PRINTDATAK", "PRINTDATAKL",
    "PRINTDATAKW", "PRINTDATAD", "PRINTDATADL", "PRINTDATADW",
    "DEBUGPRINT", "DEBUGPRINTL", "DEBUGPRINTFORM", "DEBUGPRINTFORML",
    // Wait / input
    "WAIT", "WAITANYKEY", "FORCEWAIT", "TWAIT", "AWAIT",
    "INPUT", "INPUTS", "ONEINPUT", "ONEINPUTS",
    "TINPUT", "TINPUTS", "TONEINPUT", "TONEINPUTS",
    // Control flow
    "QUIT", "RESTART", "BEGIN", "RETURN", "RETURNF", "RETURNFORM", "THROW",
    "GOTO", "GOTOFORM", "TRYGOTO", "TRYGOTOFORM", "TRYCGOTO", "TRYCGOTOFORM",
    "CALL", "CALLF", "CALLFORM", "CALLFORMF", "TRYCALL", "TRYCALLFORM",
    "TRYCCALL", "TRYCCALLFORM", "CALLTRAIN", "CALLEVENT",
    "JUMP", "JUMPFORM", "TRYJUMP", "TRYJUMPFORM", "TRYCJUMP", "TRYCJUMPFORM",
    "TRYCALLLIST", "TRYJUMPLIST", "TRYGOTOLIST", "CATCH", "ENDCATCH",
    "FUNC", "ENDFUNC",
    // Variables and bit ops
    "VARSET", "CVARSET", "GETBIT", "SETBIT", "CLEARBIT", "INVERTBIT",
    "TIMES", "SWAP", "REF", "REFBYNAME", "RESETGLOBAL", "RESETDATA",
    "PUTFORM", "SAVENOS", "OUTPUTLOG", "ASSERT",
    // Arrays
    "ARRAYSHIFT", "ARRAYREMOVE", "ARRAYCOPY", "ARRAYSORT",
    "SUMARRAY", "SUMCARRAY", "MAXARRAY", "MAXCARRAY", "MINARRAY", "MINCARRAY",
    "INRANGEARRAY", "INRANGECARRAY", "MATCH", "CMATCH", "GROUPMATCH",
    "NOSAMES", "ALLSAMES", "FINDELEMENT", "FINDLASTELEMENT", "VARSIZE",
    // Strings
    "SPLIT", "ESCAPE", "REPLACE", "STRCOUNT", "STRJOIN", "STRFORM",
    "CHARATU", "CONVERT", "TOUPPER", "TOLOWER", "TOFULL", "TOHALF",
    "ISNUMERIC", "SUBSTRING", "SUBSTRINGU",
    "STRLEN", "STRLENU", "STRLENS", "STRLENSU", "STRLENFORM", "STRLENFORMU",
    "STRFIND", "STRFINDU", "REGEXPMATCH", "ENCODETOUNI", "UNICODE",
    "TOSTR", "TOINT", "MONEYSTR",
    // HTML helpers
    "HTMLP", "HTMLFONT", "HTMLSTYLE", "HTMLCOLOR", "HTMLNOBR",
    "HTMLBUTTON", "HTMLAUTOBUTTON", "HTMLNONBUTTON",
    "HTML_PRINT", "HTML_STRINGLEN", "HTML_SUBSTRING", "HTML_STRINGLINES",
    "HTML_TAGSPLIT",
    // Math
    "ABS", "SIGN", "MAX", "MIN", "POWER", "SQRT", "CBRT", "LOG", "LOG10",
    "EXPONENT", "LIMIT", "INRANGE", "RAND", "RANDOMIZE", "INITRAND",
    "DUMPRAND", "COLOR_FROMNAME", "COLOR_FROMRGB",
    // Time
    "GETTIME", "GETTIMES", "GETSECOND", "GETMILLISECOND",
    // Character roster
    "ADDCHARA", "ADDDEFCHARA", "ADDVOIDCHARA", "ADDSPCHARA",
    "DELCHARA", "DELALLCHARA", "GETCHARA", "FINDCHARA", "FINDLASTCHARA",
    "SWAPCHARA", "SORTCHARA", "COPYCHARA", "ADDCOPYCHARA", "PICKUPCHARA",
    "EXISTCSV", "GETNUM", "GETNUMB", "GETPALAMLV", "GETEXPLV",
    // UI state
    "ALIGNMENT", "CURRENTALIGN", "REDRAW", "CURRENTREDRAW",
    "SKIPDISP", "MOUSESKIP", "NOSKIP", "ENDNOSKIP", "ISSKIP",
    "SETCOLOR", "SETCOLORBYNAME", "SETBGCOLOR", "SETBGCOLORBYNAME",
    "RESETCOLOR", "RESETBGCOLOR", "GETCOLOR", "GETBGCOLOR",
    "GETDEFCOLOR", "GETDEFBGCOLOR", "GETFOCUSCOLOR",
    "SETFONT", "GETFONT", "CHKFONT", "FONTBOLD", "FONTITALIC", "FONTREGULAR",
    "FONTSTYLE", "GETSTYLE", "PRINTCPERLINE", "LINEISEMPTY",
    "DRAWLINE", "CUSTOMDRAWLINE", "DRAWLINEFORM", "CLEARLINE",
    "REUSELASTLINE", "DEBUGCLEAR", "BAR", "BARL", "BARSTR",
    // Save triggers
    "SAVEGAME", "LOADGAME", "SAVEDATA", "LOADDATA", "DELDATA", "CHKDATA",
    "SAVEGLOBAL", "LOADGLOBAL", "SAVEVAR", "LOADVAR", "SAVECHARA", "LOADCHARA",
    // CSV lookups
    "CSVNAME", "CSVCALLNAME", "CSVNICKNAME", "CSVMASTERNAME", "CSVBASE",
    "CSVCSTR", "CSVABL", "CSVTALENT", "CSVMARK", "CSVEXP", "CSVRELATION",
    "CSVJUEL", "CSVEQUIP", "CSVCFLAG",
    // Meta queries
    "ISDEFINED", "EXISTVAR", "GETVAR", "GETVARS", "SETVAR", "EXISTFUNCTION",
    "ENUMFUNCBEGINSWITH", "ENUMFUNCENDSWITH", "ENUMFUNCWITH",
    "ENUMVARBEGINSWITH", "ENUMVARENDSWITH", "ENUMVARWITH",
    "ENUMMACROBEGINSWITH", "ENUMMACROENDSWITH", "ENUMMACROWITH", "ISACTIVE",
    // Accepted no-ops from the wider Emuera surface
    "MOUSEX", "MOUSEY", "RESET_STAIN", "STOPCALLTRAIN",
    "CBGCLEAR", "CBGCLEARBUTTON", "CBGREMOVEBMAP", "CLEARTEXTBOX",
    "UPCHECK", "CUPCHECK", "DOTRAIN", "FORCEKANA", "INPUTMOUSEKEY",
    "TOOLTIP_SETCOLOR", "TOOLTIP_SETDELAY", "TOOLTIP_SETDURATION",
];

static KNOWN_COMMANDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| COMMAND_NAMES.iter().copied().collect());

pub fn is_known_command(name: &str) -> bool {
    KNOWN_COMMANDS.contains(name)
}

pub fn known_command_count() -> usize {
    KNOWN_COMMANDS.len()
}

pub fn known_commands() -> impl Iterator<Item = &'static str> {
    COMMAND_NAMES.iter().copied()
}

/// Detects a known command written without whitespace before its argument,
/// e.g. `PRINTL"x"`. Longest match wins; the following char must not be an
/// identifier character.
pub fn split_known_command_prefix(raw: &str) -> Option<(String, String)> {
    let trimmed = raw.trim();
    let upper = trimmed.to_uppercase();
    let mut best: &str = "";
    for cmd in KNOWN_COMMANDS.iter() {
        if !upper.starts_with(cmd) || cmd.len() <= best.len() {
            continue;
        }
        if upper.len() == cmd.len() {
            best = cmd;
            continue;
        }
        let rest = &upper[cmd.len()..];
        match rest.chars().next() {
            Some(c) if is_ident_part(c) => {}
            _ => best = cmd,
        }
    }
    if best.is_empty() {
        return None;
    }
    Some((best.to_string(), trimmed[best.len()..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_surface_is_preserved() {
        assert!(known_command_count() >= 268, "only {} known commands", known_command_count());
    }

    #[test]
    fn prefix_split_takes_longest_match() {
        let (cmd, rest) = split_known_command_prefix("PRINTFORML{A}").unwrap();
        assert_eq!(cmd, "PRINTFORML");
        assert_eq!(rest, "{A}");
        assert!(split_known_command_prefix("PRINTABLE").is_none());
    }
}
