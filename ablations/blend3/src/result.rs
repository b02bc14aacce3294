//! 实验结果.

use crate::algos::Profile;
use std::io::{self, Write};

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.6}"),
            None => "/".to_string(),
        }
    }

    #[inline]
    fn u64_to_display(u: Option<u64>) -> String {
        match u {
            Some(u) => u.to_string(),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Volumes: {}", p.get_volumes())?;
    writeln!(w, "{S4}Total machine time: {} us", p.get_total_time_us())?;
    writeln!(
        w,
        "{S4}Average reconstruction error: {}",
        f64_to_display(p.get_avg_seam_error())
    )?;
    writeln!(w, "{S4}Voxels changed by refinement: {}", p.get_refined())?;
    let t = p.get_most_time_consuming().map(|d| d.as_micros() as u64);
    write!(w, "{S4}Most time-consuming volume costs {} us", u64_to_display(t))?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        let mut stdout = io::stdout().lock();
        for (name, profile) in self.data.iter() {
            utils::sep_to(&mut stdout);
            describe_into(name, profile, &mut stdout).expect("写入 stdout 失败");
            writeln!(&mut stdout).unwrap();
        }
        utils::sep_to(&mut stdout);
    }
}
